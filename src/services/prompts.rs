//! 评分提示词

use phf::phf_map;

use crate::models::TestOutcome;
use crate::services::scorer::ScoringRequest;

/// 失败案例预览的最大字符数
pub const PREVIEW_CHARS: usize = 200;

/// 评分标准，按一般题 / 额外题区分；`{max_score}` 在组装时替换
static SCORE_INSTRUCTIONS: phf::Map<&'static str, &'static str> = phf_map! {
    "base" => "总共 {max_score} 分，按输入处理、核心逻辑、输出格式三部分酌情给分。\n\
               以未通过的测试案例为主要依据判断程序问题，逻辑错误按比例扣分。",
    "ex" => "总共 {max_score} 分，只区分对错：\n\
             - 输入、逻辑、输出任何一项错误即 0 分，没有部分给分\n\
             - 只有完全正确才给 {max_score} 分",
};

const SYSTEM_PROMPT: &str = "你是一位严谨的程序作业批改助教。";

const NOTES: &str = "\
- 任何拼写错误整题最多只扣 1 分
- 测试数据已覆盖所有需要考虑的输入情况，不要推测测试之外的边界情况
- 不考虑代码风格与程序结构";

pub fn score_instructions(is_extra: bool, max_score: u32) -> String {
    let key = if is_extra { "ex" } else { "base" };
    SCORE_INSTRUCTIONS
        .get(key)
        .copied()
        .unwrap_or_default()
        .replace("{max_score}", &max_score.to_string())
}

/// 组装 (system, user) 消息
pub fn build_scoring_messages(request: &ScoringRequest<'_>) -> (String, String) {
    let description = request
        .problem_description
        .map(str::trim)
        .filter(|d| !d.is_empty())
        .unwrap_or("（未提供题目描述，请根据程序与测试结果判断）");

    let user = format!(
        r#"【编号】
{identifier}

【作业题目】
{description}

【学生程序】
```c
{source}
```

【测试结果】
- 通过: {passed}/{total}
- 失败案例:
{failed}

【评分标准】
{instructions}

【注意事项】
{notes}
---

请只以 JSON 格式回复，不要包含其他内容：
{{"score": <0 到 {max_score} 的整数>, "reason": "<说明得到或被扣的分数项目>"}}"#,
        identifier = request.unit,
        description = description,
        source = request.source_code,
        passed = request.passed_tests(),
        total = request.total_tests(),
        failed = format_failed_tests(request.outcomes),
        instructions = score_instructions(request.unit.is_extra(), request.max_score),
        notes = NOTES,
        max_score = request.max_score,
    );

    (SYSTEM_PROMPT.to_string(), user)
}

/// 失败案例详情
pub fn format_failed_tests(outcomes: &[TestOutcome]) -> String {
    let failed: Vec<&TestOutcome> = outcomes.iter().filter(|o| !o.verdict.is_pass()).collect();
    if failed.is_empty() {
        return "无失败案例".to_string();
    }

    failed
        .iter()
        .map(|outcome| {
            let mut detail = format!("\n测试案例: {} ({})", outcome.case_name, outcome.verdict.label());
            match &outcome.error {
                Some(error) => detail.push_str(&format!("\n  错误: {}", error)),
                None => {
                    detail.push_str(&format!("\n  预期输出:\n{}", preview(&outcome.expected)));
                    detail.push_str(&format!("\n  实际输出:\n{}", preview(&outcome.stdout)));
                }
            }
            detail
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn preview(text: &str) -> String {
    if text.chars().count() > PREVIEW_CHARS {
        text.chars().take(PREVIEW_CHARS).collect::<String>() + "..."
    } else {
        text.to_string()
    }
}
