//! # 服务器启动
//!
//! 绑定监听地址，挂载代理路由，收到 Ctrl+C / SIGTERM 后优雅退出

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;

use crate::app::AppContext;
use crate::error::{ProxyError, Result};
use crate::logging::{LogComponent, LogStage};
use crate::proxy::{ProxyState, create_router};
use crate::{lerror, linfo};

/// 处理 Ctrl+C 信号
async fn handle_ctrl_c_signal() -> String {
    match tokio::signal::ctrl_c().await {
        Ok(()) => "Ctrl+C signal".to_string(),
        Err(e) => {
            lerror!(
                "system",
                LogStage::Shutdown,
                LogComponent::ServerSetup,
                "ctrl_c_error",
                &format!("Failed to listen for Ctrl+C: {e:?}")
            );
            std::future::pending::<String>().await
        }
    }
}

#[cfg(unix)]
async fn handle_terminate_signal() -> String {
    use tokio::signal::unix::{SignalKind, signal};

    match signal(SignalKind::terminate()) {
        Ok(mut stream) => {
            stream.recv().await;
            "SIGTERM signal".to_string()
        }
        Err(e) => {
            lerror!(
                "system",
                LogStage::Shutdown,
                LogComponent::ServerSetup,
                "sigterm_error",
                &format!("Failed to listen for SIGTERM: {e:?}")
            );
            std::future::pending::<String>().await
        }
    }
}

#[cfg(not(unix))]
async fn handle_terminate_signal() -> String {
    std::future::pending::<String>().await
}

async fn shutdown_signal() {
    let reason = tokio::select! {
        reason = handle_ctrl_c_signal() => reason,
        reason = handle_terminate_signal() => reason,
    };
    linfo!(
        "system",
        LogStage::Shutdown,
        LogComponent::ServerSetup,
        "shutdown_signal",
        &format!("Received {reason}, shutting down")
    );
}

/// 启动代理服务器，直到收到退出信号
pub async fn run_server(context: AppContext) -> Result<()> {
    let server = &context.config.server;
    let addr = format!("{}:{}", server.host, server.port);

    let orchestrator = Arc::new(context.build_orchestrator());
    let router = create_router(ProxyState::new(orchestrator, server), server);

    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|e| ProxyError::server_init_with_source(format!("Failed to bind {addr}"), e))?;

    linfo!(
        "system",
        LogStage::Startup,
        LogComponent::ServerSetup,
        "server_start",
        &format!("Proxy server listening on {addr}"),
        upstream = %context.config.upstream.display_name
    );

    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .map_err(|e| ProxyError::server_start_with_source("Proxy server exited with error", e))?;

    linfo!(
        "system",
        LogStage::Shutdown,
        LogComponent::ServerSetup,
        "server_stopped",
        "代理服务器已停止"
    );
    context.cache.log_stats().await;
    Ok(())
}
