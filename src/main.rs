use std::path::PathBuf;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use lazy_grader::utils::init_logging;
use lazy_grader::{App, Config, Selection};

/// 批量批改 C / C++ 作业
#[derive(Parser, Debug)]
#[command(name = "lazy_grader", version, about)]
struct Cli {
    /// TOML 配置文件
    #[arg(long, global = true, env = "GRADER_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// 编译、测试、评分并生成报告（默认）
    Grade(RunArgs),
    /// 只编译，检查编译错误
    Build(RunArgs),
    /// 从进度日志重新生成报告
    Report,
    /// 删除工作目录和结果文件（保留 .log）
    Clear,
}

#[derive(Args, Debug, Default)]
struct RunArgs {
    /// 同时处理的单元数量
    #[arg(short, long)]
    workers: Option<usize>,

    /// 只处理指定学号（逗号分隔），已完成的也会重新处理
    #[arg(short, long, value_delimiter = ',')]
    student: Vec<String>,
}

impl RunArgs {
    fn apply(&self, config: &mut Config) -> Selection {
        if let Some(workers) = self.workers {
            config.workers = workers;
        }
        Selection::from_students(&self.student)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // 加载配置
    let mut config = Config::load(cli.config.as_deref())?;

    let command = cli.command.unwrap_or(Command::Grade(RunArgs::default()));
    let selection = match &command {
        Command::Grade(args) | Command::Build(args) => args.apply(&mut config),
        Command::Report | Command::Clear => Selection::Pending,
    };

    // 初始化日志（guard 必须活到程序结束）
    let _log_guards = init_logging(&config.results_dir, config.verbose_logging)?;

    let app = App::new(config);
    match command {
        Command::Grade(_) => {
            app.grade(selection).await?;
        }
        Command::Build(_) => app.build(selection).await?,
        Command::Report => app.report().await?,
        Command::Clear => app.clear().await?,
    }

    Ok(())
}
