use anyhow::{Context, Result};
use clap::{Arg, ArgMatches, Command};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use ddl_core::EngineConfig;

mod app;

use app::Application;

fn job_id_arg() -> Arg {
    Arg::new("job-id")
        .long("job-id")
        .value_name("ID")
        .help("作业ID")
        .required(true)
        .value_parser(clap::value_parser!(i64))
}

#[tokio::main]
async fn main() -> Result<()> {
    // 解析命令行参数
    let matches = Command::new("ddl-engine")
        .version("0.3.0")
        .about("分布式SQL数据库的DDL作业编排引擎")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("配置文件路径")
                .default_value("config/ddl-engine.toml"),
        )
        .arg(
            Arg::new("log-level")
                .short('l')
                .long("log-level")
                .value_name("LEVEL")
                .help("日志级别")
                .value_parser(["trace", "debug", "info", "warn", "error"])
                .default_value("info"),
        )
        .arg(
            Arg::new("log-format")
                .long("log-format")
                .value_name("FORMAT")
                .help("日志格式")
                .value_parser(["json", "pretty"])
                .default_value("pretty"),
        )
        .subcommand(Command::new("run").about("启动引擎：执行崩溃恢复并等待作业"))
        .subcommand(Command::new("show").about("查看作业及其任务状态").arg(job_id_arg()))
        .subcommand(Command::new("pause").about("请求暂停作业").arg(job_id_arg()))
        .subcommand(Command::new("resume").about("恢复暂停的作业").arg(job_id_arg()))
        .subcommand(
            Command::new("skip")
                .about("跳过一个尚未执行的任务")
                .arg(job_id_arg())
                .arg(
                    Arg::new("task-id")
                        .long("task-id")
                        .value_name("ID")
                        .help("任务ID")
                        .required(true)
                        .value_parser(clap::value_parser!(i64)),
                ),
        )
        .subcommand(Command::new("rollback").about("请求回滚作业").arg(job_id_arg()))
        .get_matches();

    let config_path = matches.get_one::<String>("config").unwrap();
    let log_level = matches.get_one::<String>("log-level").unwrap();
    let log_format = matches.get_one::<String>("log-format").unwrap();

    // 初始化日志系统
    init_logging(log_level, log_format)?;

    // 加载配置
    let config = EngineConfig::load(Some(config_path))
        .with_context(|| format!("加载配置文件失败: {config_path}"))?;

    let app = Application::new(config).await?;

    match matches.subcommand() {
        None | Some(("run", _)) => {
            info!("启动DDL作业编排引擎");
            app.run().await?;
        }
        Some(("show", sub)) => {
            app.show_job(required_job_id(sub)).await?;
        }
        Some(("pause", sub)) => {
            app.pause_job(required_job_id(sub)).await?;
        }
        Some(("resume", sub)) => {
            app.resume_job(required_job_id(sub)).await?;
        }
        Some(("skip", sub)) => {
            let task_id = *sub.get_one::<i64>("task-id").unwrap();
            app.skip_task(required_job_id(sub), task_id).await?;
        }
        Some(("rollback", sub)) => {
            app.rollback_job(required_job_id(sub)).await?;
        }
        Some((other, _)) => {
            anyhow::bail!("不支持的子命令: {other}");
        }
    }

    Ok(())
}

fn required_job_id(matches: &ArgMatches) -> i64 {
    *matches.get_one::<i64>("job-id").unwrap()
}

/// 初始化日志系统
fn init_logging(log_level: &str, log_format: &str) -> Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    let registry = tracing_subscriber::registry().with(env_filter);

    match log_format {
        "json" => {
            registry
                .with(tracing_subscriber::fmt::layer().json())
                .try_init()
                .context("初始化JSON日志格式失败")?;
        }
        "pretty" => {
            registry
                .with(tracing_subscriber::fmt::layer().pretty())
                .try_init()
                .context("初始化Pretty日志格式失败")?;
        }
        _ => {
            anyhow::bail!("不支持的日志格式: {log_format}");
        }
    }

    Ok(())
}
