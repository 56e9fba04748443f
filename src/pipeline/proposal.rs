//! Savings proposal calculator.
//!
//! Two independent modes:
//! - **Structured**: a bill read from a document (total, public-lighting fee,
//!   connection type, tariff). The distributor's minimum fee is subtracted
//!   before applying the saving rate.
//! - **Free-form**: a bare amount typed by the contact. A flat minimum of 50
//!   is subtracted regardless of connection type.
//!
//! Both are pure; rounding is to two decimals, half away from zero.

use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use rust_decimal::{Decimal, RoundingStrategy};
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use crate::lead::fold_tag;

/// Share of the billable base the contact saves each month.
pub const SAVING_RATE: Decimal = dec!(0.20);

/// Tariff (per kWh) assumed when the bill does not state one.
pub const DEFAULT_TARIFF: Decimal = dec!(0.8);

/// Minimum kWh billed when the connection type is unknown.
pub const DEFAULT_MINIMUM_KWH: Decimal = dec!(50);

/// Flat amount subtracted in free-form mode.
pub const FREE_FORM_MINIMUM_FEE: Decimal = dec!(50);

/// Grid connection type printed on the bill.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionType {
    Monofasico,
    Bifasico,
    Trifasico,
}

impl ConnectionType {
    /// Minimum kWh the distributor bills for this connection.
    pub fn minimum_kwh(self) -> Decimal {
        match self {
            Self::Monofasico => dec!(30),
            Self::Bifasico => dec!(50),
            Self::Trifasico => dec!(100),
        }
    }

    /// Parse a connection type tag ("MONOFÁSICO", "bifasico", "three-phase").
    pub fn parse(tag: &str) -> Option<Self> {
        match fold_tag(tag).as_str() {
            "monofasico" | "monofasica" | "single phase" => Some(Self::Monofasico),
            "bifasico" | "bifasica" | "two phase" => Some(Self::Bifasico),
            "trifasico" | "trifasica" | "three phase" => Some(Self::Trifasico),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Monofasico => "MONOFASICO",
            Self::Bifasico => "BIFASICO",
            Self::Trifasico => "TRIFASICO",
        }
    }
}

impl fmt::Display for ConnectionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured billing data extracted from an electricity bill.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BillingData {
    pub total_value: Decimal,
    #[serde(default)]
    pub cip_fee: Decimal,
    #[serde(default)]
    pub connection_type: Option<ConnectionType>,
    #[serde(default)]
    pub tariff: Option<Decimal>,
}

/// Which formula produced a proposal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProposalMode {
    Structured,
    FreeForm,
}

/// Savings estimate presented to the contact.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Proposal {
    pub mode: ProposalMode,
    pub minimum_fee_value: Decimal,
    pub base: Decimal,
    pub monthly_saving: Decimal,
    pub annual_saving: Decimal,
    pub five_year_saving: Decimal,
}

impl Proposal {
    fn from_base(mode: ProposalMode, minimum_fee_value: Decimal, base: Decimal) -> Option<Self> {
        if base <= Decimal::ZERO {
            return None;
        }
        let monthly = base * SAVING_RATE;
        Some(Self {
            mode,
            minimum_fee_value: round2(minimum_fee_value),
            base: round2(base),
            monthly_saving: round2(monthly),
            annual_saving: round2(monthly * dec!(12)),
            five_year_saving: round2(monthly * dec!(60)),
        })
    }
}

impl fmt::Display for Proposal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "monthly saving R$ {}, annual saving R$ {}, five-year saving R$ {}",
            self.monthly_saving, self.annual_saving, self.five_year_saving
        )
    }
}

/// Structured mode: compute the proposal from bill fields.
///
/// Returns `None` when nothing is left after the lighting fee and the
/// minimum fee.
pub fn calculate(billing: &BillingData) -> Option<Proposal> {
    let minimum_kwh = billing
        .connection_type
        .map(ConnectionType::minimum_kwh)
        .unwrap_or(DEFAULT_MINIMUM_KWH);
    let tariff = billing.tariff.unwrap_or(DEFAULT_TARIFF);
    let minimum_fee_value = minimum_kwh * tariff;
    let base = billing.total_value - billing.cip_fee - minimum_fee_value;
    Proposal::from_base(ProposalMode::Structured, minimum_fee_value, base)
}

/// Free-form mode: compute the proposal from an amount typed by the contact.
pub fn calculate_free_form(amount: &str) -> Option<Proposal> {
    let value = parse_amount(amount)?;
    Proposal::from_base(
        ProposalMode::FreeForm,
        FREE_FORM_MINIMUM_FEE,
        value - FREE_FORM_MINIMUM_FEE,
    )
}

/// First run of digits with `.`/`,` separators.
static AMOUNT: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\d[\d.,]*").unwrap());

/// Extract the first monetary amount from free text.
///
/// Accepts plain (`200`, `199.90`) and Brazilian (`R$ 1.234,56`) notation.
/// A dot followed by exactly three digits with no comma is a thousands
/// separator.
pub fn parse_amount(text: &str) -> Option<Decimal> {
    let raw = AMOUNT.find(text)?.as_str().trim_end_matches(['.', ',']);

    let normalized = if raw.contains(',') {
        raw.replace('.', "").replace(',', ".")
    } else if raw.matches('.').count() > 1 {
        raw.replace('.', "")
    } else if let Some((_, frac)) = raw.split_once('.') {
        if frac.len() == 3 {
            raw.replace('.', "")
        } else {
            raw.to_string()
        }
    } else {
        raw.to_string()
    };

    Decimal::from_str(&normalized).ok()
}

fn round2(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}
