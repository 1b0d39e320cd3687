//! Process configuration from `LUMEN_*` environment variables.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use lumen_core::{LumenError, LumenResult, Sensitive};
use lumen_sql::{validate_connection_string, ConnectionTarget, SslMode};

use crate::crypto::KEY_LEN;
use crate::pager::{HARD_CAP, MAX_PAGE_SIZE};
use crate::session::SESSION_TTL_SECS;
use crate::transaction::TRANSACTION_TTL_SECS;

pub const SUPERADMIN_URL_VAR: &str = "LUMEN_SUPERADMIN_URL";
pub const ENCRYPTION_KEY_VAR: &str = "LUMEN_ENCRYPTION_KEY";

const DEFAULT_PROBE_TIMEOUT_SECS: u64 = 10;
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 15;
const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 15;
/// Upper bound for every duration setting: one year.
const MAX_DURATION_SECS: u64 = 365 * 24 * 60 * 60;

#[derive(Debug, Clone)]
pub struct Config {
    /// Catalog reader; also the template every per-user target derives from.
    pub superadmin: ConnectionTarget,
    pub encryption_key: Sensitive<[u8; KEY_LEN]>,
    pub page_size: u64,
    pub hard_cap: u64,
    pub session_ttl_secs: i64,
    pub transaction_ttl_secs: i64,
    pub probe_timeout: Duration,
    pub connect_timeout: Duration,
    pub sweep_interval: Duration,
    pub log_dir: Option<PathBuf>,
}

impl Config {
    pub fn from_env() -> LumenResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from any key lookup.
    pub fn from_lookup<F>(lookup: F) -> LumenResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let url = get(SUPERADMIN_URL_VAR)
            .ok_or_else(|| LumenError::invalid_input(format!("{} is required", SUPERADMIN_URL_VAR)))?;
        let mut superadmin = validate_connection_string(&url)?;
        if let Some(host) = get("LUMEN_PG_HOST") {
            superadmin.host = host.trim().to_string();
        }
        if let Some(port) = parse_var::<u16>(&get, "LUMEN_PG_PORT")? {
            superadmin.port = port;
        }
        if let Some(sslmode) = get("LUMEN_PG_SSLMODE") {
            superadmin.sslmode = SslMode::from_str(&sslmode)?;
        }

        let key_hex = get(ENCRYPTION_KEY_VAR)
            .ok_or_else(|| LumenError::invalid_input(format!("{} is required", ENCRYPTION_KEY_VAR)))?;
        let encryption_key = parse_key(key_hex.trim())?;

        let seconds = |key: &str, default: u64| -> LumenResult<u64> {
            let value = parse_var::<u64>(&get, key)?.unwrap_or(default);
            if value == 0 {
                return Err(LumenError::invalid_input(format!("{} must be positive", key)));
            }
            if value > MAX_DURATION_SECS {
                return Err(LumenError::invalid_input(format!(
                    "{} must be at most {} seconds",
                    key, MAX_DURATION_SECS
                )));
            }
            Ok(value)
        };

        Ok(Self {
            superadmin,
            encryption_key: Sensitive::new(encryption_key),
            page_size: parse_var::<u64>(&get, "LUMEN_PAGE_SIZE")?
                .unwrap_or(MAX_PAGE_SIZE)
                .clamp(1, MAX_PAGE_SIZE),
            hard_cap: parse_var::<u64>(&get, "LUMEN_HARD_CAP")?
                .unwrap_or(HARD_CAP)
                .clamp(1, HARD_CAP),
            session_ttl_secs: seconds("LUMEN_SESSION_TTL_SECS", SESSION_TTL_SECS as u64)? as i64,
            transaction_ttl_secs: seconds("LUMEN_TRANSACTION_TTL_SECS", TRANSACTION_TTL_SECS as u64)?
                as i64,
            probe_timeout: Duration::from_secs(seconds(
                "LUMEN_PROBE_TIMEOUT_SECS",
                DEFAULT_PROBE_TIMEOUT_SECS,
            )?),
            connect_timeout: Duration::from_secs(seconds(
                "LUMEN_CONNECT_TIMEOUT_SECS",
                DEFAULT_CONNECT_TIMEOUT_SECS,
            )?),
            sweep_interval: Duration::from_secs(seconds(
                "LUMEN_SWEEP_INTERVAL_SECS",
                DEFAULT_SWEEP_INTERVAL_SECS,
            )?),
            log_dir: get("LUMEN_LOG_DIR").map(PathBuf::from),
        })
    }
}

fn parse_var<T: FromStr>(
    get: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> LumenResult<Option<T>> {
    match get(key) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| LumenError::invalid_input(format!("{} has an invalid value", key))),
        None => Ok(None),
    }
}

fn parse_key(hex_key: &str) -> LumenResult<[u8; KEY_LEN]> {
    let bytes = hex::decode(hex_key)
        .map_err(|_| LumenError::invalid_input(format!("{} must be hex", ENCRYPTION_KEY_VAR)))?;
    <[u8; KEY_LEN]>::try_from(bytes.as_slice()).map_err(|_| {
        LumenError::invalid_input(format!(
            "{} must be {} hex characters",
            ENCRYPTION_KEY_VAR,
            KEY_LEN * 2
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    const KEY: &str = "000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f";

    fn config(vars: &[(&str, &str)]) -> LumenResult<Config> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| map.get(key).cloned())
    }

    fn base() -> Vec<(&'static str, &'static str)> {
        vec![
            (SUPERADMIN_URL_VAR, "postgres://admin:root@pg:5433/postgres?sslmode=require"),
            (ENCRYPTION_KEY_VAR, KEY),
        ]
    }

    #[test]
    fn test_defaults() {
        let cfg = config(&base()).unwrap();
        assert_eq!(cfg.superadmin.host, "pg");
        assert_eq!(cfg.superadmin.port, 5433);
        assert_eq!(cfg.superadmin.sslmode, SslMode::Require);
        assert_eq!(cfg.encryption_key.expose()[1], 1);
        assert_eq!(cfg.page_size, 50);
        assert_eq!(cfg.hard_cap, 1000);
        assert_eq!(cfg.session_ttl_secs, 86400);
        assert_eq!(cfg.transaction_ttl_secs, 60);
        assert_eq!(cfg.probe_timeout, Duration::from_secs(10));
        assert_eq!(cfg.connect_timeout, Duration::from_secs(15));
        assert_eq!(cfg.sweep_interval, Duration::from_secs(15));
        assert!(cfg.log_dir.is_none());
    }

    #[test]
    fn test_overrides_and_clamps() {
        let mut vars = base();
        vars.extend([
            ("LUMEN_PG_HOST", "db.internal"),
            ("LUMEN_PG_PORT", "6000"),
            ("LUMEN_PG_SSLMODE", "disable"),
            ("LUMEN_PAGE_SIZE", "500"),
            ("LUMEN_HARD_CAP", "250"),
            ("LUMEN_TRANSACTION_TTL_SECS", "5"),
            ("LUMEN_LOG_DIR", "/var/log/lumen"),
        ]);
        let cfg = config(&vars).unwrap();
        assert_eq!(cfg.superadmin.host, "db.internal");
        assert_eq!(cfg.superadmin.port, 6000);
        assert_eq!(cfg.superadmin.sslmode, SslMode::Disable);
        assert_eq!(cfg.page_size, 50);
        assert_eq!(cfg.hard_cap, 250);
        assert_eq!(cfg.transaction_ttl_secs, 5);
        assert_eq!(cfg.log_dir, Some(PathBuf::from("/var/log/lumen")));
    }

    #[test]
    fn test_missing_required() {
        let err = config(&[(ENCRYPTION_KEY_VAR, KEY)]).unwrap_err();
        assert_eq!(err.code(), "INVALID_INPUT");

        let err = config(&[(SUPERADMIN_URL_VAR, "postgres://admin@pg/postgres")]).unwrap_err();
        assert!(err.to_string().contains(ENCRYPTION_KEY_VAR));
    }

    #[test]
    fn test_invalid_values() {
        let mut vars = base();
        vars.push(("LUMEN_PG_PORT", "seventy"));
        assert!(config(&vars).is_err());

        let mut vars = base();
        vars.push(("LUMEN_PROBE_TIMEOUT_SECS", "0"));
        assert!(config(&vars).is_err());

        for huge in ["18446744073709551615", "31536001"] {
            let mut vars = base();
            vars.push(("LUMEN_SESSION_TTL_SECS", huge));
            assert_eq!(config(&vars).unwrap_err().code(), "INVALID_INPUT");
        }
        let mut vars = base();
        vars.push(("LUMEN_TRANSACTION_TTL_SECS", "31536000"));
        assert_eq!(config(&vars).unwrap().transaction_ttl_secs, 31_536_000);

        let vars = vec![
            (SUPERADMIN_URL_VAR, "mysql://admin@pg/postgres"),
            (ENCRYPTION_KEY_VAR, KEY),
        ];
        assert_eq!(config(&vars).unwrap_err().code(), "INVALID_CONNECTION_STRING");

        let vars = vec![
            (SUPERADMIN_URL_VAR, "postgres://admin@pg/postgres"),
            (ENCRYPTION_KEY_VAR, "abcd"),
        ];
        assert!(config(&vars).is_err());
    }
}
