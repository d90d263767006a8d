use serde::Deserialize;

/// Default payment confirmation template.
pub const DEFAULT_PAYMENT_TEMPLATE: &str = "Hello {{.Name}}, we have received your payment of KES {{.Paid}} on {{.PaidDate}}. Your new balance is KES {{.Loaned}}. Thank you!";

/// What the ledger does when a payment exceeds the outstanding balance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverpaymentPolicy {
    /// Reduce the balance to zero and record the payment in full.
    Clamp,
    /// Refuse the assignment with a conflict error.
    Reject,
}

impl std::str::FromStr for OverpaymentPolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "clamp" => Ok(OverpaymentPolicy::Clamp),
            "reject" => Ok(OverpaymentPolicy::Reject),
            other => Err(anyhow::anyhow!(
                "OVERPAYMENT_POLICY must be 'clamp' or 'reject', got '{}'",
                other
            )),
        }
    }
}

/// Global application configuration loaded from environment variables.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// PostgreSQL connection string
    pub database_url: String,

    /// Maximum number of PostgreSQL connections in the pool (default: 20)
    pub db_max_connections: u32,

    /// Redis connection string for the task queue
    pub redis_url: String,

    /// Port the API server binds to (default: 8080)
    pub http_port: u16,

    /// Outbound SMS gateway endpoint (required by the worker)
    pub sms_gateway_url: Option<String>,

    /// Bearer token for the SMS gateway (required by the worker)
    pub sms_gateway_api_key: Option<String>,

    /// Sender id placed in the gateway `from` field (default: CONNECT)
    pub sms_sender_id: String,

    /// Gateway request timeout in seconds (default: 10)
    pub sms_gateway_timeout_secs: u64,

    /// Consumers draining the critical lane (default: 10)
    pub queue_concurrency_critical: usize,

    /// Consumers draining the default lane (default: 5)
    pub queue_concurrency_default: usize,

    /// Consumers draining the low lane (default: 2)
    pub queue_concurrency_low: usize,

    /// Idle delay between empty queue polls in milliseconds (default: 250)
    pub queue_poll_interval_ms: u64,

    /// Fixed retry backoff in seconds (default: 2)
    pub queue_retry_delay_secs: u64,

    /// Return in-flight tasks to pending when the worker starts (default: true).
    /// Enable on a single worker process only.
    pub queue_recover_inflight: bool,

    /// Outbox sweeper period in seconds (default: 5)
    pub outbox_sweep_interval_secs: u64,

    /// Graceful shutdown drain budget in seconds (default: 30)
    pub shutdown_timeout_secs: u64,

    /// Policy for payments larger than the outstanding balance (default: clamp)
    pub overpayment_policy: OverpaymentPolicy,

    /// Template used for automated payment confirmations
    pub payment_sms_template: String,
}

impl AppConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        Ok(Self {
            database_url: std::env::var("DATABASE_URL")
                .map_err(|_| anyhow::anyhow!("DATABASE_URL environment variable is required"))?,
            db_max_connections: parse_var("DB_MAX_CONNECTIONS", "20")?,
            redis_url: std::env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://localhost:6379".to_string()),
            http_port: parse_var("HTTP_PORT", "8080")?,
            sms_gateway_url: std::env::var("SMS_GATEWAY_URL").ok(),
            sms_gateway_api_key: std::env::var("SMS_GATEWAY_API_KEY").ok(),
            sms_sender_id: std::env::var("SMS_SENDER_ID").unwrap_or_else(|_| "CONNECT".to_string()),
            sms_gateway_timeout_secs: parse_var("SMS_GATEWAY_TIMEOUT_SECS", "10")?,
            queue_concurrency_critical: parse_var("QUEUE_CONCURRENCY_CRITICAL", "10")?,
            queue_concurrency_default: parse_var("QUEUE_CONCURRENCY_DEFAULT", "5")?,
            queue_concurrency_low: parse_var("QUEUE_CONCURRENCY_LOW", "2")?,
            queue_poll_interval_ms: parse_var("QUEUE_POLL_INTERVAL_MS", "250")?,
            queue_retry_delay_secs: parse_var("QUEUE_RETRY_DELAY_SECS", "2")?,
            queue_recover_inflight: parse_var("QUEUE_RECOVER_INFLIGHT", "true")?,
            outbox_sweep_interval_secs: parse_var("OUTBOX_SWEEP_INTERVAL_SECS", "5")?,
            shutdown_timeout_secs: parse_var("SHUTDOWN_TIMEOUT_SECS", "30")?,
            overpayment_policy: parse_var("OVERPAYMENT_POLICY", "clamp")?,
            payment_sms_template: std::env::var("PAYMENT_SMS_TEMPLATE")
                .unwrap_or_else(|_| DEFAULT_PAYMENT_TEMPLATE.to_string()),
        })
    }
}

/// Read an environment variable, falling back to `default`, and parse it.
fn parse_var<T>(name: &str, default: &str) -> anyhow::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    std::env::var(name)
        .unwrap_or_else(|_| default.to_string())
        .parse()
        .map_err(|e| anyhow::anyhow!("{} is invalid: {}", name, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overpayment_policy_parse() {
        assert_eq!(
            "clamp".parse::<OverpaymentPolicy>().unwrap(),
            OverpaymentPolicy::Clamp
        );
        assert_eq!(
            " Reject ".parse::<OverpaymentPolicy>().unwrap(),
            OverpaymentPolicy::Reject
        );
        assert!("negative".parse::<OverpaymentPolicy>().is_err());
    }

    #[test]
    fn test_default_template_has_all_fields() {
        for field in ["Name", "Paid", "PaidDate", "Loaned"] {
            assert!(DEFAULT_PAYMENT_TEMPLATE.contains(&format!("{{{{.{}}}}}", field)));
        }
    }
}
