//! Pure scoring of a payment attempt. No I/O: everything the scorer needs is
//! passed in by the orchestrator.

use super::payment::{CardInput, Metadata, PaymentMethod};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskFactor {
    HighAmount,
    MissingCvc,
    MissingBillingPostalCode,
    CountryMismatch,
    RecentFailedAttempts(u32),
    LargeBankTransfer,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskAssessment {
    pub score: u8,
    pub level: RiskLevel,
    pub factors: Vec<RiskFactor>,
}

pub struct RiskInput<'a> {
    pub amount: Decimal,
    pub method: PaymentMethod,
    pub card: Option<&'a CardInput>,
    pub metadata: &'a Metadata,
    /// Failed attempts against the same order in the last hour.
    pub recent_failed_attempts: u32,
}

pub fn score(input: &RiskInput<'_>) -> RiskAssessment {
    let mut score: u32 = 0;
    let mut factors = Vec::new();

    let amount_points = if input.amount > dec!(10000) {
        30
    } else if input.amount > dec!(5000) {
        20
    } else if input.amount > dec!(1000) {
        10
    } else {
        0
    };
    if amount_points > 0 {
        score += amount_points;
        factors.push(RiskFactor::HighAmount);
    }

    if input.method.is_card() {
        if let Some(card) = input.card {
            if card.cvc.as_deref().is_none_or(str::is_empty) {
                score += 15;
                factors.push(RiskFactor::MissingCvc);
            }
            if card.billing_postal_code.is_none() {
                score += 5;
                factors.push(RiskFactor::MissingBillingPostalCode);
            }
            let ip_country = input.metadata.get("ip_country");
            if let (Some(billing), Some(ip)) = (card.billing_country.as_ref(), ip_country) {
                if !billing.eq_ignore_ascii_case(ip) {
                    score += 20;
                    factors.push(RiskFactor::CountryMismatch);
                }
            }
        }
    }

    if input.recent_failed_attempts > 0 {
        score += (input.recent_failed_attempts * 10).min(30);
        factors.push(RiskFactor::RecentFailedAttempts(input.recent_failed_attempts));
    }

    if input.method == PaymentMethod::BankTransfer && input.amount > dec!(5000) {
        score += 10;
        factors.push(RiskFactor::LargeBankTransfer);
    }

    let score = score.min(100) as u8;
    let level = match score {
        0..30 => RiskLevel::Low,
        30..70 => RiskLevel::Medium,
        _ => RiskLevel::High,
    };

    RiskAssessment {
        score,
        level,
        factors,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn card() -> CardInput {
        CardInput {
            number: "4242424242424242".to_string(),
            exp_month: 1,
            exp_year: 2099,
            cvc: Some("123".to_string()),
            billing_postal_code: Some("94107".to_string()),
            billing_country: Some("US".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_small_cash_payment_is_low_risk() {
        let metadata = Metadata::new();
        let assessment = score(&RiskInput {
            amount: dec!(25.00),
            method: PaymentMethod::Cash,
            card: None,
            metadata: &metadata,
            recent_failed_attempts: 0,
        });
        assert_eq!(assessment.score, 0);
        assert_eq!(assessment.level, RiskLevel::Low);
        assert!(assessment.factors.is_empty());
    }

    #[test]
    fn test_card_risk_factors_accumulate() {
        let mut metadata = Metadata::new();
        metadata.insert("ip_country".to_string(), "RO".to_string());
        let mut card = card();
        card.cvc = None;

        let assessment = score(&RiskInput {
            amount: dec!(6000),
            method: PaymentMethod::CreditCard,
            card: Some(&card),
            metadata: &metadata,
            recent_failed_attempts: 0,
        });
        // 20 (amount) + 15 (cvc) + 20 (country)
        assert_eq!(assessment.score, 55);
        assert_eq!(assessment.level, RiskLevel::Medium);
        assert!(assessment.factors.contains(&RiskFactor::CountryMismatch));
    }

    #[test]
    fn test_score_is_capped() {
        let mut metadata = Metadata::new();
        metadata.insert("ip_country".to_string(), "RO".to_string());
        let card = CardInput {
            billing_country: Some("US".to_string()),
            ..Default::default()
        };
        let assessment = score(&RiskInput {
            amount: dec!(50000),
            method: PaymentMethod::CreditCard,
            card: Some(&card),
            metadata: &metadata,
            recent_failed_attempts: 9,
        });
        assert_eq!(assessment.score, 100);
        assert_eq!(assessment.level, RiskLevel::High);
    }
}
