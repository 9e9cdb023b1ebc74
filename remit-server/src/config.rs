//! Environment-driven configuration. Per-tenant credentials arrive as
//! suffixed variables (`PROCESSOR_SECRET_KEY_<TENANT>`), so adding a tenant
//! is an ops action, not a deploy.

use std::collections::HashMap;
use std::net::SocketAddr;

use remit_processor::TenantCredentials;

pub const DEFAULT_BIND_ADDR: &str = "127.0.0.1:8080";

pub type ConfigResult<T> = Result<T, ConfigError>;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {message}")]
    Invalid { key: String, message: String },
    #[error("tenant {tenant} is missing {key}")]
    MissingTenantKey { tenant: String, key: String },
    #[error("no tenants configured")]
    NoTenants,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TenantConfig {
    pub tenant_id: String,
    pub api_key: String,
    pub credentials: TenantCredentials,
    /// Static plan → feature map from `ENTITLEMENTS_JSON_<TENANT>`.
    pub entitlements: HashMap<String, Vec<String>>,
}

impl TenantConfig {
    /// Empty entitlements mean "no plan gating".
    #[must_use]
    pub fn allows_plan(&self, plan_code: &str) -> bool {
        self.entitlements.is_empty() || self.entitlements.contains_key(plan_code)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ServerConfig {
    pub bind_addr: SocketAddr,
    pub database_url: Option<String>,
    pub processor_sandbox: bool,
    pub production: bool,
    pub signature_tolerance_seconds: i64,
    pub webhook_max_attempts: u32,
    pub payment_retry_schedule_days: Vec<i64>,
    pub max_payment_retry_attempts: u32,
    pub idempotency_ttl_days: i64,
    pub tenants: HashMap<String, TenantConfig>,
}

impl ServerConfig {
    pub fn from_env<I>(vars: I) -> ConfigResult<Self>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let vars: HashMap<String, String> = vars.into_iter().collect();

        let bind_addr = vars
            .get("BIND_ADDR")
            .map_or(DEFAULT_BIND_ADDR, String::as_str)
            .parse::<SocketAddr>()
            .map_err(|err| ConfigError::Invalid {
                key: "BIND_ADDR".into(),
                message: err.to_string(),
            })?;

        let processor_sandbox = parse_bool(&vars, "PROCESSOR_SANDBOX", true)?;
        let production = vars
            .get("APP_ENV")
            .is_some_and(|env| env.eq_ignore_ascii_case("production"));
        let signature_tolerance_seconds = parse_i64(
            &vars,
            "WEBHOOK_SIGNATURE_TOLERANCE_SECONDS",
            remit_processor::signature::DEFAULT_TOLERANCE_SECONDS,
        )?;
        let webhook_max_attempts = parse_i64(
            &vars,
            "WEBHOOK_RETRY_MAX_ATTEMPTS",
            i64::from(remit_retry::DEFAULT_WEBHOOK_MAX_ATTEMPTS),
        )?
        .try_into()
        .map_err(|_| ConfigError::Invalid {
            key: "WEBHOOK_RETRY_MAX_ATTEMPTS".into(),
            message: "must be a positive integer".into(),
        })?;
        let max_payment_retry_attempts = parse_i64(
            &vars,
            "MAX_PAYMENT_RETRY_ATTEMPTS",
            i64::from(remit_retry::dunning::DEFAULT_MAX_ATTEMPTS),
        )?
        .try_into()
        .map_err(|_| ConfigError::Invalid {
            key: "MAX_PAYMENT_RETRY_ATTEMPTS".into(),
            message: "must be a positive integer".into(),
        })?;
        let idempotency_ttl_days = parse_i64(
            &vars,
            "IDEMPOTENCY_TTL_DAYS",
            remit_idempotency::DEFAULT_TTL_DAYS,
        )?;

        let payment_retry_schedule_days = match vars.get("PAYMENT_RETRY_SCHEDULE_DAYS") {
            None => remit_retry::dunning::DEFAULT_SCHEDULE_DAYS.to_vec(),
            Some(raw) => raw
                .split(',')
                .map(|part| {
                    part.trim().parse::<i64>().map_err(|err| ConfigError::Invalid {
                        key: "PAYMENT_RETRY_SCHEDULE_DAYS".into(),
                        message: format!("{part:?}: {err}"),
                    })
                })
                .collect::<ConfigResult<Vec<i64>>>()?,
        };

        let tenants = parse_tenants(&vars)?;
        if tenants.is_empty() {
            return Err(ConfigError::NoTenants);
        }

        Ok(Self {
            bind_addr,
            database_url: vars.get("DATABASE_URL").cloned(),
            processor_sandbox,
            production,
            signature_tolerance_seconds,
            webhook_max_attempts,
            payment_retry_schedule_days,
            max_payment_retry_attempts,
            idempotency_ttl_days,
            tenants,
        })
    }

    #[must_use]
    pub fn tenant_by_api_key(&self, api_key: &str) -> Option<&TenantConfig> {
        self.tenants
            .values()
            .find(|tenant| tenant.api_key == api_key)
    }

    #[must_use]
    pub fn tenant(&self, tenant_id: &str) -> Option<&TenantConfig> {
        self.tenants.get(tenant_id)
    }
}

fn parse_bool(vars: &HashMap<String, String>, key: &str, default: bool) -> ConfigResult<bool> {
    match vars.get(key) {
        None => Ok(default),
        Some(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" => Ok(true),
            "false" | "0" | "no" => Ok(false),
            other => Err(ConfigError::Invalid {
                key: key.into(),
                message: format!("expected boolean, got {other:?}"),
            }),
        },
    }
}

fn parse_i64(vars: &HashMap<String, String>, key: &str, default: i64) -> ConfigResult<i64> {
    match vars.get(key) {
        None => Ok(default),
        Some(raw) => raw.trim().parse::<i64>().map_err(|err| ConfigError::Invalid {
            key: key.into(),
            message: err.to_string(),
        }),
    }
}

/// Collects tenant ids from every `PROCESSOR_SECRET_KEY_<TENANT>` variable,
/// then requires the companion keys for each.
fn parse_tenants(vars: &HashMap<String, String>) -> ConfigResult<HashMap<String, TenantConfig>> {
    let mut tenants = HashMap::new();
    for key in vars.keys() {
        let Some(suffix) = key.strip_prefix("PROCESSOR_SECRET_KEY_") else {
            continue;
        };
        let tenant_id = suffix.to_ascii_lowercase();

        let secret_key = require_tenant_var(vars, suffix, "PROCESSOR_SECRET_KEY")?;
        let account_id = require_tenant_var(vars, suffix, "PROCESSOR_ACCOUNT_ID")?;
        let webhook_secret = require_tenant_var(vars, suffix, "PROCESSOR_WEBHOOK_SECRET")?;
        let api_key = require_tenant_var(vars, suffix, "API_KEY")?;

        let entitlements = match vars.get(&format!("ENTITLEMENTS_JSON_{suffix}")) {
            None => HashMap::new(),
            Some(raw) => {
                serde_json::from_str(raw).map_err(|err| ConfigError::Invalid {
                    key: format!("ENTITLEMENTS_JSON_{suffix}"),
                    message: err.to_string(),
                })?
            }
        };

        tenants.insert(
            tenant_id.clone(),
            TenantConfig {
                tenant_id,
                api_key,
                credentials: TenantCredentials {
                    account_id,
                    secret_key,
                    webhook_secret,
                },
                entitlements,
            },
        );
    }
    Ok(tenants)
}

fn require_tenant_var(
    vars: &HashMap<String, String>,
    suffix: &str,
    prefix: &str,
) -> ConfigResult<String> {
    vars.get(&format!("{prefix}_{suffix}"))
        .cloned()
        .ok_or_else(|| ConfigError::MissingTenantKey {
            tenant: suffix.to_ascii_lowercase(),
            key: format!("{prefix}_{suffix}"),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn base_vars() -> Vec<(String, String)> {
        vec![
            ("PROCESSOR_SECRET_KEY_ACME".into(), "sk_acme".into()),
            ("PROCESSOR_ACCOUNT_ID_ACME".into(), "acct_acme".into()),
            ("PROCESSOR_WEBHOOK_SECRET_ACME".into(), "whsec_acme".into()),
            ("API_KEY_ACME".into(), "key_acme".into()),
        ]
    }

    #[test]
    fn minimal_config_applies_defaults() {
        let config = ServerConfig::from_env(base_vars()).expect("config");
        assert_eq!(config.bind_addr.to_string(), DEFAULT_BIND_ADDR);
        assert!(config.processor_sandbox);
        assert!(!config.production);
        assert_eq!(config.signature_tolerance_seconds, 300);
        assert_eq!(config.webhook_max_attempts, 5);
        assert_eq!(config.payment_retry_schedule_days, vec![1, 3, 7, 7]);
        assert_eq!(config.idempotency_ttl_days, 30);

        let tenant = config.tenant("acme").expect("tenant");
        assert_eq!(tenant.credentials.webhook_secret, "whsec_acme");
        assert!(tenant.allows_plan("anything"));
    }

    #[test]
    fn missing_companion_key_is_an_error() {
        let mut vars = base_vars();
        vars.retain(|(key, _)| key != "PROCESSOR_WEBHOOK_SECRET_ACME");
        let err = ServerConfig::from_env(vars).unwrap_err();
        assert!(matches!(err, ConfigError::MissingTenantKey { .. }));
    }

    #[test]
    fn no_tenants_is_an_error() {
        let err = ServerConfig::from_env(Vec::new()).unwrap_err();
        assert!(matches!(err, ConfigError::NoTenants));
    }

    #[test]
    fn entitlements_gate_plans() {
        let mut vars = base_vars();
        vars.push((
            "ENTITLEMENTS_JSON_ACME".into(),
            r#"{"pro-monthly": ["invoicing", "dunning"]}"#.into(),
        ));
        let config = ServerConfig::from_env(vars).expect("config");
        let tenant = config.tenant("acme").expect("tenant");
        assert!(tenant.allows_plan("pro-monthly"));
        assert!(!tenant.allows_plan("enterprise"));
    }

    #[test]
    fn invalid_numbers_and_bools_are_rejected() {
        let mut vars = base_vars();
        vars.push(("WEBHOOK_RETRY_MAX_ATTEMPTS".into(), "five".into()));
        assert!(matches!(
            ServerConfig::from_env(vars).unwrap_err(),
            ConfigError::Invalid { .. }
        ));

        let mut vars = base_vars();
        vars.push(("PROCESSOR_SANDBOX".into(), "maybe".into()));
        assert!(matches!(
            ServerConfig::from_env(vars).unwrap_err(),
            ConfigError::Invalid { .. }
        ));
    }

    #[test]
    fn custom_retry_schedule_parses() {
        let mut vars = base_vars();
        vars.push(("PAYMENT_RETRY_SCHEDULE_DAYS".into(), "2, 5, 9".into()));
        let config = ServerConfig::from_env(vars).expect("config");
        assert_eq!(config.payment_retry_schedule_days, vec![2, 5, 9]);
    }

    #[test]
    fn api_key_lookup_resolves_tenant() {
        let config = ServerConfig::from_env(base_vars()).expect("config");
        assert_eq!(
            config.tenant_by_api_key("key_acme").map(|t| t.tenant_id.as_str()),
            Some("acme")
        );
        assert!(config.tenant_by_api_key("key_unknown").is_none());
    }
}
