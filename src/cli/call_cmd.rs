//! `call` subcommand: one request through the client pool.
//!
//! The member address comes from `--addr` (or `RPCX_CALL_ADDR`) and is
//! published into an in-process discovery table before the call.

use std::sync::Arc;

use crate::client::discovery::MemoryDiscovery;
use crate::client::pool::{ConnectionPool, PoolConfig};
use crate::client::transport::TcpTransportFactory;
use crate::client::xclient::ClientOptions;
use crate::host::DEVELOP_MODE;
use crate::service::reply::Payload;
use crate::value::Args;

pub const DEFAULT_CALL_ADDR: &str = "127.0.0.1:9000";
const CLI_BASE_PATH: &str = "/rpcx_cli";

/// Member address from `RPCX_CALL_ADDR` or the default.
pub fn default_addr() -> String {
    match std::env::var("RPCX_CALL_ADDR") {
        Ok(a) if !a.is_empty() => a,
        _ => DEFAULT_CALL_ADDR.to_string(),
    }
}

/// Call `path` on `service` at `addr` and print the reply. Returns the exit code.
pub async fn run_call(service: &str, path: &str, args: Args, addr: &str) -> i32 {
    let discovery = MemoryDiscovery::new();
    discovery.insert(CLI_BASE_PATH, service, &format!("tcp@{}", addr));
    let pool = ConnectionPool::new(
        PoolConfig {
            base_path: CLI_BASE_PATH.to_string(),
            client: ClientOptions::for_mode(DEVELOP_MODE),
            renew_one_in: 0,
        },
        Arc::new(discovery),
        Arc::new(TcpTransportFactory),
    );

    let result = pool.call(service, path, args).await;
    pool.close_all().await;
    match result {
        Ok(payload) => {
            println!("{}", render(&payload));
            0
        }
        Err(e) => {
            eprintln!("call {}.{} failed: {}", service, path, e);
            1
        }
    }
}

fn render(payload: &Payload) -> String {
    match payload {
        Payload::Reply(reply) => {
            serde_json::to_string_pretty(reply).unwrap_or_else(|e| format!("<unprintable reply: {}>", e))
        }
        Payload::Text(text) => text.clone(),
        Payload::Bytes(bytes) => String::from_utf8_lossy(bytes).into_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::reply::Reply;

    #[test]
    fn test_render_forms() {
        assert_eq!(render(&Payload::Text("ok".into())), "ok");
        assert_eq!(render(&Payload::Bytes(b"{}".to_vec())), "{}");
        let text = render(&Payload::Reply(Reply::error(404, "missing")));
        assert!(text.contains("\"code\": 404"));
    }

    #[tokio::test]
    async fn test_unreachable_member_fails() {
        let code = run_call("user", "health", Args::new(), "127.0.0.1:1").await;
        assert_eq!(code, 1);
    }
}
