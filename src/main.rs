//! # Completion Proxy 主程序
//!
//! 计费补全 API 前的限流与缓存代理

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use completion_proxy::{
    Result,
    app::AppContext,
    config::load_config,
    lerror, linfo,
    logging::{self, LogComponent, LogFormat, LogStage},
    server,
};

#[derive(Debug, Parser)]
#[command(name = "completion-proxy", version, about)]
struct Args {
    /// 配置文件路径
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// 覆盖监听地址
    #[arg(long)]
    host: Option<String>,

    /// 覆盖监听端口
    #[arg(short, long)]
    port: Option<u16>,

    /// 只加载并校验配置，然后退出
    #[arg(long)]
    check_config: bool,

    /// 日志格式：compact | json
    #[arg(long, env = "PROXY_LOG_FORMAT", default_value = "compact")]
    log_format: LogFormat,

    /// 日志级别，`RUST_LOG` 优先
    #[arg(long, env = "PROXY_LOG_LEVEL")]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    logging::init_logging(args.log_format, args.log_level.as_deref());

    let mut config = match load_config(args.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            lerror!(
                "system",
                LogStage::Configuration,
                LogComponent::Main,
                "config_load_failed",
                &format!("配置加载失败: {e}")
            );
            return Err(e);
        }
    };
    if let Some(host) = args.host {
        config.server.host = host;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }
    config.validate()?;

    if args.check_config {
        linfo!(
            "system",
            LogStage::Configuration,
            LogComponent::Main,
            "config_ok",
            "配置校验通过"
        );
        return Ok(());
    }

    linfo!(
        "system",
        LogStage::Startup,
        LogComponent::Main,
        "service_starting",
        "服务启动"
    );
    let context = AppContext::from_config(Arc::new(config)).await?;
    if let Err(e) = server::run_server(context).await {
        lerror!(
            "system",
            LogStage::Startup,
            LogComponent::Main,
            "service_start_failed",
            &format!("服务启动失败: {e:?}")
        );
        std::process::exit(1);
    }

    linfo!(
        "system",
        LogStage::Shutdown,
        LogComponent::Main,
        "service_shutdown",
        "服务正常关闭"
    );
    Ok(())
}
