//! Local control endpoint: translates dashboard actions into compose
//! invocations and detaches them so the HTTP caller never blocks on
//! docker.

use anyops_common::{ControlRequest, ControlResponse};
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use std::sync::Arc;
use tracing::{error, info, warn};

/// Where the compose project and its env files live on a managed node.
#[derive(Debug, Clone)]
pub struct ComposeContext {
    pub workdir: String,
    pub env_base: String,
}

impl Default for ComposeContext {
    fn default() -> Self {
        Self {
            workdir: "/home/anyadmin/docker".to_string(),
            env_base: "anyops".to_string(),
        }
    }
}

pub fn build_router(ctx: ComposeContext) -> Router {
    Router::new()
        .route("/health", get(|| async { "OK" }))
        .route("/container/control", post(handle_control))
        .with_state(Arc::new(ctx))
}

/// Container names reach the shell line below, so anything that could
/// split into extra words or chain a second command is rejected.
fn valid_container_name(name: &str) -> bool {
    !name.is_empty() && !name.contains(char::is_whitespace) && !name.contains(';')
}

/// The full `bash -c` line for one action, or `None` for an unknown
/// action. Each service gets a shared env file plus a per-service one.
pub fn compose_command(ctx: &ComposeContext, name: &str, action: &str) -> Option<String> {
    let verb = match action {
        "start" => format!("up -d {name}"),
        "restart" => format!("up -d --force-recreate {name}"),
        "stop" => format!("stop {name}"),
        _ => return None,
    };
    Some(format!(
        "cd {} && docker compose --env-file {base}.env --env-file {base}.env-{name} {verb}",
        ctx.workdir,
        base = ctx.env_base,
    ))
}

async fn handle_control(
    State(ctx): State<Arc<ComposeContext>>,
    Json(req): Json<ControlRequest>,
) -> (StatusCode, Json<ControlResponse>) {
    if !valid_container_name(&req.container_name) {
        return (
            StatusCode::BAD_REQUEST,
            Json(ControlResponse {
                success: false,
                message: "Invalid container name".to_string(),
                output: String::new(),
            }),
        );
    }

    let command = match compose_command(&ctx, &req.container_name, &req.action) {
        Some(cmd) => cmd,
        None => {
            return (
                StatusCode::BAD_REQUEST,
                Json(ControlResponse {
                    success: false,
                    message: "Unknown action. Supported: start, stop, restart".to_string(),
                    output: String::new(),
                }),
            )
        }
    };

    info!(container = %req.container_name, action = %req.action, "control request");

    // Detach: compose pulls can take minutes and concurrent calls for
    // the same service are left to compose's own idempotency.
    tokio::spawn(async move {
        match tokio::process::Command::new("bash")
            .arg("-c")
            .arg(&command)
            .output()
            .await
        {
            Ok(out) if out.status.success() => {
                info!(command = %command, "container action completed");
            }
            Ok(out) => {
                warn!(
                    command = %command,
                    code = ?out.status.code(),
                    stderr = %String::from_utf8_lossy(&out.stderr),
                    "container action failed"
                );
            }
            Err(err) => error!(command = %command, %err, "failed to spawn container action"),
        }
    });

    (
        StatusCode::OK,
        Json(ControlResponse {
            success: true,
            message: "Action triggered in background".to_string(),
            output: String::new(),
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn container_names_with_shell_metacharacters_are_rejected() {
        assert!(valid_container_name("vllm-qwen3"));
        assert!(!valid_container_name("vllm qwen3"));
        assert!(!valid_container_name("vllm;rm"));
        assert!(!valid_container_name(""));
    }

    #[test]
    fn compose_command_covers_the_three_actions() {
        let ctx = ComposeContext::default();
        assert_eq!(
            compose_command(&ctx, "vllm", "start").unwrap(),
            "cd /home/anyadmin/docker && docker compose --env-file anyops.env --env-file anyops.env-vllm up -d vllm"
        );
        assert_eq!(
            compose_command(&ctx, "vllm", "restart").unwrap(),
            "cd /home/anyadmin/docker && docker compose --env-file anyops.env --env-file anyops.env-vllm up -d --force-recreate vllm"
        );
        assert_eq!(
            compose_command(&ctx, "milvus", "stop").unwrap(),
            "cd /home/anyadmin/docker && docker compose --env-file anyops.env --env-file anyops.env-milvus stop milvus"
        );
        assert!(compose_command(&ctx, "vllm", "pause").is_none());
    }
}
