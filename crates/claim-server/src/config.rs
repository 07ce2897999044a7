//! Configuration management for the claim server.

use alloy::primitives::{utils::parse_ether, Address, U256};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

const PLACEHOLDER_SECRET: &str = "change_me_to_a_long_random_secret_value_0000";
const PLACEHOLDER_PRIVATE_KEY: &str = "your_private_key_here";

/// Configuration for the claim server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaimConfig {
    /// HTTP server configuration
    pub http: HttpConfig,

    /// Ethereum node and distributor wallet
    pub ethereum: EthereumConfig,

    /// The ERC-20 token being distributed
    pub token: TokenConfig,

    /// Gas spending limits
    pub gas: GasConfig,

    /// SMTP email configuration
    pub smtp: SmtpConfig,

    /// Secrets, expiries and rate limits
    pub security: SecurityConfig,

    /// Admin credentials
    pub admin: AdminConfig,
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    /// Port to bind to
    pub port: u16,

    /// Address to bind to
    pub bind_address: String,

    /// Public URL of the claim portal; its host is the SIWE domain
    pub app_url: String,
}

/// Ethereum blockchain configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EthereumConfig {
    /// RPC endpoint URL
    pub rpc_url: String,

    /// Chain id embedded in wallet challenges
    pub chain_id: u64,

    /// Private key for the distributor wallet (hex string, optional 0x prefix)
    pub private_key: String,

    /// Upper bound for any single read RPC call
    pub rpc_timeout_secs: u64,

    /// Upper bound for waiting on a transfer receipt
    pub receipt_timeout_secs: u64,
}

/// Token contract configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenConfig {
    /// ERC-20 contract address
    pub contract_address: String,

    /// Display symbol
    pub symbol: String,

    /// Expected on-chain decimals
    pub decimals: u8,

    /// Chain label stored on allocation rows
    pub chain: String,
}

/// Gas spending limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GasConfig {
    /// Gas limit ceiling applied to complex token transfers
    pub max_gas_limit: u64,

    /// Maximum estimated transfer cost in ETH (decimal string)
    pub max_gas_cost_eth: String,

    /// Sanity ceiling for the network gas price
    pub max_gas_price_gwei: u64,

    /// Gas price used when the node cannot report one
    pub fallback_gas_price_gwei: u64,
}

/// SMTP configuration for sending emails
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmtpConfig {
    /// When false, codes are logged instead of mailed
    pub enabled: bool,

    /// SMTP server hostname
    pub server: String,

    /// SMTP server port
    pub port: u16,

    /// Username for authentication
    pub username: String,

    /// Password for authentication
    pub password: String,

    /// From email address
    pub from_address: String,

    /// Subject of the verification code email
    pub code_subject: String,

    /// Subject of the claim receipt email
    pub receipt_subject: String,

    /// Block explorer base URL for transaction links
    pub explorer_url: String,
}

/// A sliding-window rate limit rule
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct RateLimitRule {
    /// Requests allowed within the window
    pub max_requests: u32,

    /// Window length in seconds
    pub window_secs: u64,
}

impl RateLimitRule {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

/// Security and rate limiting configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    /// Server-side HMAC/encryption secret ("pepper")
    pub pepper: String,

    /// HS256 session signing secret
    pub session_secret: String,

    /// One-time code lifetime in minutes
    pub code_expiry_minutes: u64,

    /// Wrong guesses allowed before a code is destroyed
    pub max_code_attempts: u32,

    /// Session lifetime in minutes
    pub session_ttl_minutes: u64,

    /// Wallet challenge lifetime in minutes
    pub nonce_ttl_minutes: u64,

    /// Requests per client IP
    pub ip_limit: RateLimitRule,

    /// Code requests per email identifier
    pub email_limit: RateLimitRule,

    /// Code verification attempts per email identifier
    pub code_limit: RateLimitRule,

    /// Cleanup interval for expired records and idle limiter windows in minutes
    pub cleanup_interval_minutes: u64,

    /// Take the client address from `X-Forwarded-For` / `X-Real-IP`. Enable only behind a
    /// reverse proxy that overwrites those headers.
    #[serde(default)]
    pub trust_proxy_headers: bool,
}

/// Admin basic-auth credentials
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminConfig {
    pub username: String,
    pub password: String,
}

impl Default for ClaimConfig {
    fn default() -> Self {
        Self {
            http: HttpConfig {
                port: 3000,
                bind_address: "127.0.0.1".to_string(),
                app_url: "http://localhost:3000".to_string(),
            },
            ethereum: EthereumConfig {
                rpc_url: "https://rpc.ankr.com/eth".to_string(),
                chain_id: 1,
                private_key: PLACEHOLDER_PRIVATE_KEY.to_string(),
                rpc_timeout_secs: 15,
                receipt_timeout_secs: 180,
            },
            token: TokenConfig {
                contract_address: "0x2e105875765e46d93A301A9FE0e81d98d070200e".to_string(),
                symbol: "GOC".to_string(),
                decimals: 18,
                chain: "ethereum".to_string(),
            },
            gas: GasConfig {
                max_gas_limit: 100_000,
                max_gas_cost_eth: "0.0025".to_string(),
                max_gas_price_gwei: 100,
                fallback_gas_price_gwei: 20,
            },
            smtp: SmtpConfig {
                enabled: false,
                server: "smtp.gmail.com".to_string(),
                port: 587,
                username: "your_email@gmail.com".to_string(),
                password: "your_app_password".to_string(),
                from_address: "claims@example.com".to_string(),
                code_subject: "Your Claim Verification Code".to_string(),
                receipt_subject: "Your Token Claim Receipt".to_string(),
                explorer_url: "https://etherscan.io".to_string(),
            },
            security: SecurityConfig {
                pepper: PLACEHOLDER_SECRET.to_string(),
                session_secret: PLACEHOLDER_SECRET.to_string(),
                code_expiry_minutes: 15,
                max_code_attempts: 5,
                session_ttl_minutes: 30,
                nonce_ttl_minutes: 15,
                ip_limit: RateLimitRule {
                    max_requests: 100,
                    window_secs: 60,
                },
                email_limit: RateLimitRule {
                    max_requests: 3,
                    window_secs: 300,
                },
                code_limit: RateLimitRule {
                    max_requests: 10,
                    window_secs: 900,
                },
                cleanup_interval_minutes: 10,
                trust_proxy_headers: false,
            },
            admin: AdminConfig {
                username: "admin".to_string(),
                password: String::new(),
            },
        }
    }
}

impl ClaimConfig {
    /// Load configuration from a TOML file, with `CLAIM__SECTION__KEY` environment overrides
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, config::ConfigError> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path.as_ref()).format(config::FileFormat::Toml))
            .add_source(config::Environment::with_prefix("CLAIM").separator("__"))
            .build()?;

        settings.try_deserialize()
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let toml_string = toml::to_string_pretty(self)?;
        std::fs::write(path, toml_string)?;
        Ok(())
    }

    /// The SIWE domain: host (and port, if any) of the public app URL
    pub fn siwe_domain(&self) -> anyhow::Result<String> {
        let url = url::Url::parse(&self.http.app_url)?;
        let host = url
            .host_str()
            .ok_or_else(|| anyhow::anyhow!("App URL has no host"))?;
        Ok(match url.port() {
            Some(port) => format!("{}:{}", host, port),
            None => host.to_string(),
        })
    }

    /// The configured token contract address
    pub fn token_address(&self) -> anyhow::Result<Address> {
        Address::from_str(&self.token.contract_address)
            .map_err(|e| anyhow::anyhow!("Invalid token contract address: {}", e))
    }

    /// Configured gas cost cap in wei
    pub fn max_gas_cost_wei(&self) -> anyhow::Result<U256> {
        parse_ether(&self.gas.max_gas_cost_eth)
            .map_err(|e| anyhow::anyhow!("Invalid max_gas_cost_eth: {}", e))
    }

    /// Validate the configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.ethereum.private_key == PLACEHOLDER_PRIVATE_KEY {
            return Err(anyhow::anyhow!("Distributor private key must be configured"));
        }

        let key = self
            .ethereum
            .private_key
            .strip_prefix("0x")
            .unwrap_or(&self.ethereum.private_key);
        if key.len() != 64 || hex::decode(key).is_err() {
            return Err(anyhow::anyhow!("Private key must be 64 hex characters"));
        }

        self.token_address()?;
        self.siwe_domain()?;

        // U256 holds at most 77 decimal digits
        if self.token.decimals > 77 {
            return Err(anyhow::anyhow!("Token decimals must be at most 77"));
        }

        if self.max_gas_cost_wei()?.is_zero() {
            return Err(anyhow::anyhow!("max_gas_cost_eth must be positive"));
        }

        if self.gas.max_gas_limit < 21_000 {
            return Err(anyhow::anyhow!("max_gas_limit must be at least 21000"));
        }

        for (name, secret) in [
            ("pepper", &self.security.pepper),
            ("session_secret", &self.security.session_secret),
        ] {
            if secret == PLACEHOLDER_SECRET {
                return Err(anyhow::anyhow!("security.{} must be configured", name));
            }
            if secret.len() < 32 {
                return Err(anyhow::anyhow!("security.{} must be at least 32 characters", name));
            }
        }

        if self.security.code_expiry_minutes == 0
            || self.security.session_ttl_minutes == 0
            || self.security.nonce_ttl_minutes == 0
        {
            return Err(anyhow::anyhow!("Expiry settings must be greater than 0"));
        }

        if self.security.max_code_attempts == 0 {
            return Err(anyhow::anyhow!("max_code_attempts must be greater than 0"));
        }

        if self.admin.password.is_empty() {
            return Err(anyhow::anyhow!("Admin password must be configured"));
        }

        if self.smtp.enabled && self.smtp.username == "your_email@gmail.com" {
            return Err(anyhow::anyhow!("SMTP configuration must be set when enabled"));
        }

        Ok(())
    }
}

#[cfg(test)]
pub(crate) fn test_config() -> ClaimConfig {
    let mut config = ClaimConfig::default();
    config.ethereum.private_key =
        "ac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80".to_string();
    config.security.pepper = "0123456789abcdef0123456789abcdef-pepper".to_string();
    config.security.session_secret = "0123456789abcdef0123456789abcdef-session".to_string();
    config.admin.password = "hunter2".to_string();
    config
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ClaimConfig::default();

        assert_eq!(config.http.port, 3000);
        assert_eq!(config.http.bind_address, "127.0.0.1");
        assert_eq!(config.token.decimals, 18);
        assert_eq!(config.security.code_expiry_minutes, 15);
        assert_eq!(config.security.session_ttl_minutes, 30);
        assert_eq!(config.gas.max_gas_limit, 100_000);
    }

    #[test]
    fn test_config_serialization() {
        let config = ClaimConfig::default();

        let serialized = toml::to_string(&config).unwrap();
        let deserialized: ClaimConfig = toml::from_str(&serialized).unwrap();

        assert_eq!(config.http.port, deserialized.http.port);
        assert_eq!(config.gas.max_gas_cost_eth, deserialized.gas.max_gas_cost_eth);
        assert_eq!(config.security.ip_limit, deserialized.security.ip_limit);
    }

    #[test]
    fn test_siwe_domain() {
        let mut config = ClaimConfig::default();
        assert_eq!(config.siwe_domain().unwrap(), "localhost:3000");

        config.http.app_url = "https://claim.example.org".to_string();
        assert_eq!(config.siwe_domain().unwrap(), "claim.example.org");
    }

    #[test]
    fn test_max_gas_cost_wei() {
        let config = ClaimConfig::default();
        assert_eq!(
            config.max_gas_cost_wei().unwrap(),
            U256::from(2_500_000_000_000_000u64)
        );
    }

    #[test]
    fn test_config_validation() {
        let mut config = ClaimConfig::default();

        // Should fail with default values
        assert!(config.validate().is_err());

        config = test_config();
        assert!(config.validate().is_ok());

        config.ethereum.private_key = "short".to_string();
        assert!(config.validate().is_err());

        config = test_config();
        config.security.pepper = "too-short".to_string();
        assert!(config.validate().is_err());

        config = test_config();
        config.gas.max_gas_cost_eth = "0".to_string();
        assert!(config.validate().is_err());

        config = test_config();
        config.token.contract_address = "not-an-address".to_string();
        assert!(config.validate().is_err());

        config = test_config();
        config.admin.password.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_save_and_load_config() -> anyhow::Result<()> {
        let mut config = test_config();
        config.http.port = 8080;

        let temp_dir = tempfile::tempdir()?;
        let temp_path = temp_dir.path().join("claim-config.toml");
        config.save_to_file(&temp_path)?;

        let loaded_config = ClaimConfig::from_file(&temp_path)?;

        assert_eq!(loaded_config.http.port, 8080);
        assert_eq!(loaded_config.ethereum.private_key, config.ethereum.private_key);
        assert_eq!(loaded_config.security.email_limit, config.security.email_limit);
        assert!(loaded_config.validate().is_ok());

        Ok(())
    }
}
