//! Outbound mail: verification codes and claim receipts.

use crate::config::{ClaimConfig, SmtpConfig};
use crate::error::{ClaimError, ClaimResult};
use async_trait::async_trait;
use lettre::{
    message::{header::ContentType, Mailbox},
    transport::smtp::authentication::Credentials,
    Message, SmtpTransport, Transport,
};
use tracing::{debug, error, info, warn};

const MAX_EMAIL_LEN: usize = 255;

/// Contents of a claim receipt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimReceiptMail {
    pub amount: String,
    pub symbol: String,
    pub tx_hash: String,
    pub recipient: String,
}

/// Mail delivery used by the claim pipeline. Callers treat failures as non-fatal.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send_code(&self, to: &str, code: &str) -> ClaimResult<()>;

    async fn send_claim_receipt(&self, to: &str, receipt: &ClaimReceiptMail) -> ClaimResult<()>;
}

/// Build the mailer for the configuration: SMTP when enabled, otherwise a logging stand-in.
pub fn mailer_from_config(config: &ClaimConfig) -> ClaimResult<Box<dyn Mailer>> {
    if config.smtp.enabled {
        Ok(Box::new(SmtpMailer::new(
            &config.smtp,
            config.security.code_expiry_minutes,
        )?))
    } else {
        warn!("SMTP disabled; verification codes will be written to the log");
        Ok(Box::new(LogMailer))
    }
}

/// lettre SMTP relay
#[derive(Debug)]
pub struct SmtpMailer {
    transport: SmtpTransport,
    from_address: Mailbox,
    code_subject: String,
    receipt_subject: String,
    explorer_url: String,
    code_expiry_minutes: u64,
}

impl SmtpMailer {
    pub fn new(config: &SmtpConfig, code_expiry_minutes: u64) -> ClaimResult<Self> {
        let from_address: Mailbox = config
            .from_address
            .parse()
            .map_err(|e| ClaimError::Internal(anyhow::anyhow!("Invalid from address: {}", e)))?;

        let credentials = Credentials::new(config.username.clone(), config.password.clone());

        // 465 speaks TLS from the first byte; other ports upgrade with STARTTLS
        let builder = if config.port == 465 {
            SmtpTransport::relay(&config.server)
        } else {
            SmtpTransport::starttls_relay(&config.server)
        }
        .map_err(|e| ClaimError::Internal(anyhow::anyhow!("Failed to create SMTP transport: {}", e)))?;

        let transport = builder.port(config.port).credentials(credentials).build();

        Ok(Self {
            transport,
            from_address,
            code_subject: config.code_subject.clone(),
            receipt_subject: config.receipt_subject.clone(),
            explorer_url: config.explorer_url.trim_end_matches('/').to_string(),
            code_expiry_minutes,
        })
    }

    fn code_body(&self, code: &str) -> String {
        format!(
            r#"Your verification code: {}

This code expires in {} minutes. Use it only on the official claim portal.
Never share this code with anyone.

If you didn't request this code, please ignore this email.
"#,
            code, self.code_expiry_minutes
        )
    }

    fn receipt_body(&self, receipt: &ClaimReceiptMail) -> String {
        format!(
            r#"Your claim is complete.

Amount:    {} {}
Recipient: {}
Transaction: {}

View on the block explorer: {}/tx/{}

Keep this email for your records.
"#,
            receipt.amount,
            receipt.symbol,
            receipt.recipient,
            receipt.tx_hash,
            self.explorer_url,
            receipt.tx_hash
        )
    }

    async fn send(&self, to_email: &str, subject: &str, body: String) -> ClaimResult<()> {
        let to_address: Mailbox = to_email
            .parse()
            .map_err(|e| ClaimError::InvalidEmail(format!("Invalid email address: {}", e)))?;

        let email = Message::builder()
            .from(self.from_address.clone())
            .to(to_address)
            .subject(subject)
            .header(ContentType::TEXT_PLAIN)
            .body(body)
            .map_err(|e| ClaimError::Internal(anyhow::anyhow!("Failed to build email: {}", e)))?;

        debug!("Sending \"{}\" email", subject);

        // lettre's SmtpTransport blocks
        let transport = self.transport.clone();
        let result = tokio::task::spawn_blocking(move || transport.send(&email))
            .await
            .map_err(|e| ClaimError::Internal(anyhow::anyhow!("Task join error: {}", e)))?;

        match result {
            Ok(response) => {
                info!("Sent \"{}\" email (response code {})", subject, response.code());
                Ok(())
            }
            Err(e) => {
                error!("Failed to send \"{}\" email: {}", subject, e);
                Err(ClaimError::EmailError(e))
            }
        }
    }
}

#[async_trait]
impl Mailer for SmtpMailer {
    async fn send_code(&self, to: &str, code: &str) -> ClaimResult<()> {
        self.send(to, &self.code_subject, self.code_body(code)).await
    }

    async fn send_claim_receipt(&self, to: &str, receipt: &ClaimReceiptMail) -> ClaimResult<()> {
        self.send(to, &self.receipt_subject, self.receipt_body(receipt))
            .await
    }
}

/// Development mailer that writes codes to the log instead of sending them
#[derive(Debug, Default)]
pub struct LogMailer;

#[async_trait]
impl Mailer for LogMailer {
    async fn send_code(&self, to: &str, code: &str) -> ClaimResult<()> {
        warn!("[DEV] Verification code for {}: {}", to, code);
        Ok(())
    }

    async fn send_claim_receipt(&self, to: &str, receipt: &ClaimReceiptMail) -> ClaimResult<()> {
        warn!(
            "[DEV] Claim receipt for {}: {} {}, tx {}",
            to, receipt.amount, receipt.symbol, receipt.tx_hash
        );
        Ok(())
    }
}

/// Validate email address format
pub fn validate_email(email: &str) -> ClaimResult<()> {
    if email.len() > MAX_EMAIL_LEN || !validator::validate_email(email) {
        return Err(ClaimError::InvalidEmail(email.to_string()));
    }
    Ok(())
}
