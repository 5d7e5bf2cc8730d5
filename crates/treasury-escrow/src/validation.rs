//! Input validation shared by single payouts, batches and deposits.
//!
//! Everything here runs before any side effect.

use rust_decimal::Decimal;
use treasury_types::{
    PayoutLimits, Result, TreasuryError,
    constants::{CURRENCY_SCALE, SETTLEMENT_CURRENCY, WALLET_KEY_BYTES, WALLET_MAX_LEN, WALLET_MIN_LEN},
};

/// Trim and lower-case `email`, rejecting anything that is not
/// `local@domain.tld` shaped.
pub fn normalize_email(email: &str) -> Result<String> {
    let email = email.trim().to_lowercase();
    let invalid = || TreasuryError::InvalidEmail(email.clone());

    let (local, domain) = email.split_once('@').ok_or_else(invalid)?;
    if local.is_empty() || domain.contains('@') || email.chars().any(char::is_whitespace) {
        return Err(invalid());
    }
    let Some((host, tld)) = domain.rsplit_once('.') else {
        return Err(invalid());
    };
    if host.is_empty() || tld.is_empty() {
        return Err(invalid());
    }
    Ok(email)
}

/// Positive, at most six decimal places, and within `limits`.
pub fn validate_payout_amount(amount: Decimal, limits: &PayoutLimits) -> Result<()> {
    validate_precision(amount)?;
    if amount < limits.min_amount {
        return Err(TreasuryError::InvalidAmount {
            reason: format!("minimum payout amount is {}", limits.min_amount),
        });
    }
    if amount > limits.max_amount {
        return Err(TreasuryError::InvalidAmount {
            reason: format!("maximum payout amount is {}", limits.max_amount),
        });
    }
    Ok(())
}

/// Positive with at most [`CURRENCY_SCALE`] decimal places.
pub fn validate_precision(amount: Decimal) -> Result<()> {
    if amount <= Decimal::ZERO {
        return Err(TreasuryError::InvalidAmount {
            reason: format!("amount must be positive, got {amount}"),
        });
    }
    if amount.normalize().scale() > CURRENCY_SCALE {
        return Err(TreasuryError::InvalidAmount {
            reason: format!("amount {amount} has more than {CURRENCY_SCALE} decimal places"),
        });
    }
    Ok(())
}

/// Only the settlement currency is accepted; `None` means the default.
pub fn validate_currency(currency: Option<&str>) -> Result<String> {
    match currency.map(str::trim) {
        None | Some("") => Ok(SETTLEMENT_CURRENCY.to_string()),
        Some(c) if c.eq_ignore_ascii_case(SETTLEMENT_CURRENCY) => Ok(SETTLEMENT_CURRENCY.to_string()),
        Some(other) => Err(TreasuryError::InvalidRequest {
            reason: format!("unsupported currency '{other}', only {SETTLEMENT_CURRENCY} is settled"),
        }),
    }
}

/// A base58 string of 32–44 characters decoding to a 32-byte public key.
pub fn validate_wallet(address: &str) -> Result<String> {
    let address = address.trim();
    if !(WALLET_MIN_LEN..=WALLET_MAX_LEN).contains(&address.len()) {
        return Err(TreasuryError::InvalidWallet {
            reason: format!(
                "expected {WALLET_MIN_LEN}-{WALLET_MAX_LEN} characters, got {}",
                address.len()
            ),
        });
    }
    let bytes = bs58::decode(address)
        .into_vec()
        .map_err(|e| TreasuryError::InvalidWallet {
            reason: e.to_string(),
        })?;
    if bytes.len() != WALLET_KEY_BYTES {
        return Err(TreasuryError::InvalidWallet {
            reason: format!("decodes to {} bytes, expected {WALLET_KEY_BYTES}", bytes.len()),
        });
    }
    Ok(address.to_string())
}
