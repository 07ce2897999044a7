//! EIP-4361 (Sign-In with Ethereum) messages and EIP-191 signature recovery.

use crate::error::{ClaimError, ClaimResult};
use crate::eth::validate_address;
use alloy::primitives::{Address, Signature};
use chrono::{DateTime, SecondsFormat, Utc};
use std::fmt;
use std::str::FromStr;

const HEADER_SUFFIX: &str = " wants you to sign in with your Ethereum account:";

/// A parsed or freshly built SIWE message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SiweMessage {
    pub domain: String,
    pub address: Address,
    pub statement: Option<String>,
    pub uri: String,
    pub version: String,
    pub chain_id: u64,
    pub nonce: String,
    pub issued_at: DateTime<Utc>,
    pub expiration_time: Option<DateTime<Utc>>,
    pub not_before: Option<DateTime<Utc>>,
    pub request_id: Option<String>,
    pub resources: Vec<String>,
}

fn invalid(reason: impl fmt::Display) -> ClaimError {
    ClaimError::InvalidSignature(format!("Invalid SIWE message: {}", reason))
}

fn rfc3339(time: &DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_time(field: &str, value: &str) -> ClaimResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|time| time.with_timezone(&Utc))
        .map_err(|e| invalid(format!("{} {:?}: {}", field, value, e)))
}

impl SiweMessage {
    /// Whether the message is expired (or not yet valid) at `now`.
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        let not_expired = self.expiration_time.map_or(true, |expiry| now < expiry);
        let started = self.not_before.map_or(true, |start| now >= start);
        not_expired && started
    }
}

impl fmt::Display for SiweMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}{}", self.domain, HEADER_SUFFIX)?;
        writeln!(f, "{}", self.address.to_checksum(None))?;
        writeln!(f)?;
        if let Some(statement) = &self.statement {
            writeln!(f, "{}", statement)?;
            writeln!(f)?;
        }
        writeln!(f, "URI: {}", self.uri)?;
        writeln!(f, "Version: {}", self.version)?;
        writeln!(f, "Chain ID: {}", self.chain_id)?;
        writeln!(f, "Nonce: {}", self.nonce)?;
        write!(f, "Issued At: {}", rfc3339(&self.issued_at))?;
        if let Some(expiry) = &self.expiration_time {
            write!(f, "\nExpiration Time: {}", rfc3339(expiry))?;
        }
        if let Some(start) = &self.not_before {
            write!(f, "\nNot Before: {}", rfc3339(start))?;
        }
        if let Some(request_id) = &self.request_id {
            write!(f, "\nRequest ID: {}", request_id)?;
        }
        if !self.resources.is_empty() {
            write!(f, "\nResources:")?;
            for resource in &self.resources {
                write!(f, "\n- {}", resource)?;
            }
        }
        Ok(())
    }
}

impl FromStr for SiweMessage {
    type Err = ClaimError;

    fn from_str(message: &str) -> ClaimResult<Self> {
        let mut lines = message.lines().peekable();

        let domain = lines
            .next()
            .and_then(|line| line.strip_suffix(HEADER_SUFFIX))
            .filter(|domain| !domain.is_empty())
            .ok_or_else(|| invalid("missing header"))?
            .to_string();

        let address_line = lines.next().ok_or_else(|| invalid("missing address"))?;
        let address = validate_address(address_line.trim()).map_err(|_| invalid("bad address"))?;

        if lines.next() != Some("") {
            return Err(invalid("expected blank line after address"));
        }
        while lines.peek() == Some(&"") {
            lines.next();
        }

        let mut statement = None;
        if let Some(line) = lines.peek() {
            if !line.starts_with("URI: ") {
                statement = Some(line.to_string());
                lines.next();
                if lines.next() != Some("") {
                    return Err(invalid("expected blank line after statement"));
                }
            }
        }

        let mut uri = None;
        let mut version = None;
        let mut chain_id = None;
        let mut nonce = None;
        let mut issued_at = None;
        let mut expiration_time = None;
        let mut not_before = None;
        let mut request_id = None;
        let mut resources = Vec::new();

        while let Some(line) = lines.next() {
            if line == "Resources:" {
                for resource in lines.by_ref() {
                    let resource = resource
                        .strip_prefix("- ")
                        .ok_or_else(|| invalid("bad resource line"))?;
                    resources.push(resource.to_string());
                }
                break;
            }

            let (key, value) = line
                .split_once(": ")
                .ok_or_else(|| invalid(format!("unexpected line {:?}", line)))?;
            match key {
                "URI" => uri = Some(value.to_string()),
                "Version" => version = Some(value.to_string()),
                "Chain ID" => {
                    chain_id = Some(
                        value
                            .parse::<u64>()
                            .map_err(|_| invalid(format!("bad chain id {:?}", value)))?,
                    )
                }
                "Nonce" => nonce = Some(value.to_string()),
                "Issued At" => issued_at = Some(parse_time(key, value)?),
                "Expiration Time" => expiration_time = Some(parse_time(key, value)?),
                "Not Before" => not_before = Some(parse_time(key, value)?),
                "Request ID" => request_id = Some(value.to_string()),
                other => return Err(invalid(format!("unknown field {:?}", other))),
            }
        }

        let version = version.ok_or_else(|| invalid("missing Version"))?;
        if version != "1" {
            return Err(invalid(format!("unsupported version {:?}", version)));
        }
        let nonce = nonce.ok_or_else(|| invalid("missing Nonce"))?;
        if nonce.len() < 8 || !nonce.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(invalid("nonce must be at least 8 alphanumeric characters"));
        }

        Ok(Self {
            domain,
            address,
            statement,
            uri: uri.ok_or_else(|| invalid("missing URI"))?,
            version,
            chain_id: chain_id.ok_or_else(|| invalid("missing Chain ID"))?,
            nonce,
            issued_at: issued_at.ok_or_else(|| invalid("missing Issued At"))?,
            expiration_time,
            not_before,
            request_id,
            resources,
        })
    }
}

/// Recover the EIP-191 (`personal_sign`) signer of `message` from a 65-byte hex signature.
pub fn recover_signer(message: &str, signature: &str) -> ClaimResult<Address> {
    let signature = signature.trim();
    let bytes = hex::decode(signature.strip_prefix("0x").unwrap_or(signature))
        .map_err(|_| ClaimError::InvalidSignature("Signature is not hex".to_string()))?;
    if bytes.len() != 65 {
        return Err(ClaimError::InvalidSignature(format!(
            "Signature must be 65 bytes, got {}",
            bytes.len()
        )));
    }

    let signature = Signature::try_from(bytes.as_slice())
        .map_err(|e| ClaimError::InvalidSignature(format!("Malformed signature: {}", e)))?;
    signature
        .recover_address_from_msg(message.as_bytes())
        .map_err(|e| ClaimError::InvalidSignature(format!("Failed to recover signer: {}", e)))
}
