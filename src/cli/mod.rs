//! Commands of the `rpcx-core-cli` binary.
//!
//! ```bash
//! rpcx-core-cli                         # serve (default)
//! rpcx-core-cli config show             # effective configuration
//! rpcx-core-cli config validate         # exit 0 when the service can start
//! rpcx-core-cli call user info uid=7    # one call through the client pool
//! ```

pub mod call_cmd;
pub mod config_cmd;

use std::path::PathBuf;

use crate::config::ConfigError;
use crate::value::{Args, Value};

/// Exit code for a failed `serve`: 2 when the config could not be loaded.
pub fn serve_exit_code(err: &(dyn std::error::Error + 'static)) -> u8 {
    if err.downcast_ref::<ConfigError>().is_some() {
        2
    } else {
        1
    }
}

/// Default config file, relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "service.toml";

/// Config path from `RPCX_CONFIG` or the default.
pub fn config_path() -> PathBuf {
    match std::env::var("RPCX_CONFIG") {
        Ok(p) if !p.is_empty() => PathBuf::from(p),
        _ => PathBuf::from(DEFAULT_CONFIG_PATH),
    }
}

/// Parse `key=value` words into call arguments.
///
/// Integers and `true`/`false` keep their type; anything else is a string.
pub fn parse_args<'a>(words: impl IntoIterator<Item = &'a str>) -> Result<Args, String> {
    let mut args = Args::new();
    for word in words {
        let (key, raw) = word
            .split_once('=')
            .ok_or_else(|| format!("argument '{}' is not key=value", word))?;
        if key.is_empty() {
            return Err(format!("argument '{}' has an empty key", word));
        }
        let value = if let Ok(n) = raw.parse::<i64>() {
            Value::Int(n)
        } else if let Ok(b) = raw.parse::<bool>() {
            Value::Bool(b)
        } else {
            Value::Str(raw.to_string())
        };
        args.insert(key, value);
    }
    Ok(args)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_args_types() {
        let args = parse_args(["uid=7", "debug=true", "name=ann", "q=a=b"]).unwrap();
        assert_eq!(args.get("uid"), Some(&Value::Int(7)));
        assert_eq!(args.get("debug"), Some(&Value::Bool(true)));
        assert_eq!(args.get("name"), Some(&Value::Str("ann".into())));
        assert_eq!(args.get("q"), Some(&Value::Str("a=b".into())));
    }

    #[test]
    fn test_serve_config_errors_exit_with_two() {
        let err: Box<dyn std::error::Error> =
            Box::new(ConfigError::Invalid("service name is empty".into()));
        assert_eq!(serve_exit_code(err.as_ref()), 2);

        let err: Box<dyn std::error::Error> =
            Box::new(std::io::Error::new(std::io::ErrorKind::AddrInUse, "bind"));
        assert_eq!(serve_exit_code(err.as_ref()), 1);
    }

    #[test]
    fn test_parse_args_rejects_bare_words() {
        assert!(parse_args(["uid"]).is_err());
        assert!(parse_args(["=7"]).is_err());
    }
}
