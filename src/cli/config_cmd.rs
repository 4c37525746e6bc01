//! Config subcommands: show, validate.

use std::path::Path;

use crate::config::{self, EffectiveConfig};

/// Print the effective config as key=value lines. Returns the exit code.
pub fn run_show(path: &Path) -> i32 {
    match config::load(path) {
        Ok(cfg) => {
            print_config(&cfg.effective_config());
            0
        }
        Err(e) => {
            eprintln!("ERROR: {}", e);
            2
        }
    }
}

/// Check that the service could start with this config.
///
/// Returns 0 if valid, 1 on warnings, 2 on errors.
pub fn run_validate(path: &Path) -> i32 {
    let cfg = match config::load(path) {
        Ok(cfg) => cfg.effective_config(),
        Err(e) => {
            eprintln!("ERROR: {}", e);
            return 2;
        }
    };

    let warnings = warnings(&cfg);
    for w in &warnings {
        eprintln!("WARNING: {}", w);
    }
    if warnings.is_empty() {
        println!("Configuration is valid.");
        0
    } else {
        1
    }
}

fn warnings(cfg: &EffectiveConfig) -> Vec<String> {
    let mut out = Vec::new();
    if cfg.version.is_empty() {
        out.push("service version is empty; every caller gets the wildcard variants".into());
    }
    if cfg.renew_one_in == 0 {
        out.push("renew_one_in is 0; pooled clients are never refreshed".into());
    }
    if cfg.call_timeout_ms < 100 {
        out.push(format!("call_timeout_ms is only {}", cfg.call_timeout_ms));
    }
    out
}

fn print_config(cfg: &EffectiveConfig) {
    println!("mode={}", cfg.mode);
    println!("name={}", cfg.name);
    println!("addr={}", cfg.addr);
    println!("log_dir={}", cfg.log_dir);
    println!("version={}", cfg.version);
    println!("discovery.base_path={}", cfg.discovery_base_path);
    println!("discovery.addr={}", cfg.discovery_endpoints);
    println!(
        "discovery.update_interval_secs={}",
        cfg.discovery_update_interval_secs
    );
    println!("call_timeout_ms={}", cfg.call_timeout_ms);
    println!("renew_one_in={}", cfg.renew_one_in);
    println!("log_sink_capacity={}", cfg.log_sink_capacity);
    println!("fail_mode={}", cfg.fail_mode);
    println!("select_mode={}", cfg.select_mode);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::balance::{FailMode, SelectMode};

    fn effective() -> EffectiveConfig {
        EffectiveConfig {
            mode: "production".into(),
            name: "user".into(),
            addr: "10.0.0.1:9000".into(),
            log_dir: "/var/log/user".into(),
            version: "1.0.0".into(),
            discovery_base_path: "/rpcx_production".into(),
            discovery_endpoints: "10.9.0.1:2379".into(),
            discovery_update_interval_secs: 30,
            call_timeout_ms: 15_000,
            renew_one_in: 111,
            log_sink_capacity: 100,
            fail_mode: FailMode::Failover,
            select_mode: SelectMode::RoundRobin,
        }
    }

    #[test]
    fn test_defaults_have_no_warnings() {
        assert!(warnings(&effective()).is_empty());
    }

    #[test]
    fn test_disabled_renewal_warns() {
        let mut cfg = effective();
        cfg.renew_one_in = 0;
        cfg.version.clear();
        assert_eq!(warnings(&cfg).len(), 2);
    }

    #[test]
    fn test_missing_file_is_an_error() {
        assert_eq!(run_validate(Path::new("/nonexistent/service.toml")), 2);
    }
}
