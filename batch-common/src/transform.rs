//! # Transformer (component F)
//!
//! A pure function, `flatten`, turning one `Detail` into one `OutputRow`
//! ready for pipe-delimited serialization. Holds no state and touches
//! nothing but its argument, so every case is covered by plain unit tests
//! rather than database-backed ones.

use rust_decimal::Decimal;

use crate::claim::ProcessorMode;
use crate::error::TransformError;
use crate::reader::Detail;

const DELIMITER: char = '|';

/// One flattened detail line. Field order here is output field order.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputRow {
    pub detail_id: i64,
    pub record_type: String,
    pub account_number: String,
    pub customer_name: String,
    pub amount: Decimal,
    pub currency: String,
    pub description: String,
    pub transaction_date: String,
    pub customer_email: String,
    pub merchant_name: String,
    pub item_count: usize,
    pub status: String,
    pub risk_score: Option<Decimal>,
}

/// Flatten one detail row. Rejects (rather than silently escaping) any
/// textual field that contains the output delimiter, since spec.md §4.F
/// treats that as a data-quality condition the caller must decide how to
/// handle (skip row / abort batch), not something the transformer may
/// paper over by substitution.
pub fn flatten(detail: &Detail) -> Result<OutputRow, TransformError> {
    reject_delimiter(detail.detail_id, "record_type", &detail.record_type)?;
    reject_delimiter(detail.detail_id, "account_number", &detail.account_number)?;
    reject_delimiter(detail.detail_id, "customer_name", &detail.customer_name)?;
    reject_delimiter(detail.detail_id, "currency", &detail.currency)?;
    reject_delimiter(detail.detail_id, "description", &detail.description)?;

    let (customer_email, merchant_name, item_count, status, risk_score) =
        match &detail.transaction_data {
            Some(data) => {
                reject_delimiter(detail.detail_id, "customer_email", &data.customer.email)?;
                reject_delimiter(detail.detail_id, "merchant_name", &data.merchant.name)?;
                reject_delimiter(detail.detail_id, "status", &data.status)?;
                (
                    data.customer.email.clone(),
                    data.merchant.name.clone(),
                    data.items.len(),
                    data.status.clone(),
                    data.risk_score,
                )
            }
            None => (String::new(), String::new(), 0, String::new(), None),
        };

    Ok(OutputRow {
        detail_id: detail.detail_id,
        record_type: detail.record_type.clone(),
        account_number: detail.account_number.clone(),
        customer_name: detail.customer_name.clone(),
        amount: detail.amount.round_dp(2),
        currency: detail.currency.clone(),
        description: detail.description.clone(),
        transaction_date: detail.transaction_date.format("%Y%m%d%H%M%S").to_string(),
        customer_email,
        merchant_name,
        item_count,
        status,
        risk_score,
    })
}

fn reject_delimiter(detail_id: i64, field: &'static str, value: &str) -> Result<(), TransformError> {
    if value.contains(DELIMITER) {
        return Err(TransformError::DelimiterConflict { detail_id, field });
    }
    Ok(())
}

impl OutputRow {
    /// Render as one pipe-delimited line, without a trailing newline.
    /// Relational modes (`STANDARD`/`ENHANCED`) emit the plain 8-field
    /// line; `STREAMING_JSONB` additionally appends the 5 flattened
    /// semi-structured fields.
    pub fn to_line(&self, mode: ProcessorMode) -> String {
        let base = format!(
            "{}{d}{}{d}{}{d}{}{d}{}{d}{}{d}{}",
            self.record_type,
            self.detail_id,
            self.account_number,
            self.customer_name,
            self.amount,
            self.currency,
            self.description,
            self.transaction_date,
            d = DELIMITER,
        );

        match mode {
            ProcessorMode::StreamingJsonb => format!(
                "{base}{d}{}{d}{}{d}{}{d}{}{d}{}",
                self.customer_email,
                self.merchant_name,
                self.item_count,
                self.status,
                self.risk_score.map(|v| v.to_string()).unwrap_or_default(),
                d = DELIMITER,
            ),
            ProcessorMode::Standard | ProcessorMode::Enhanced => base,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reader::{Customer, Merchant, TransactionData};
    use chrono::{TimeZone, Utc};

    fn sample_detail() -> Detail {
        Detail {
            detail_id: 42,
            master_id: 1,
            record_type: "SALE".to_owned(),
            account_number: "ACC-1".to_owned(),
            customer_name: "Jane Doe".to_owned(),
            amount: Decimal::new(10050, 2),
            currency: "USD".to_owned(),
            description: "coffee".to_owned(),
            transaction_date: Utc.with_ymd_and_hms(2026, 1, 2, 3, 4, 5).unwrap(),
            transaction_data: None,
        }
    }

    #[test]
    fn flattens_relational_row_without_transaction_data() {
        let row = flatten(&sample_detail()).unwrap();
        assert_eq!(row.amount, Decimal::new(10050, 2));
        assert_eq!(row.transaction_date, "20260102030405");
        assert_eq!(row.customer_email, "");
        assert_eq!(row.item_count, 0);
    }

    #[test]
    fn flattens_jsonb_row_with_transaction_data() {
        let mut detail = sample_detail();
        detail.transaction_data = Some(TransactionData {
            customer: Customer {
                email: "jane@example.com".to_owned(),
                ..Default::default()
            },
            merchant: Merchant {
                name: "Coffee Co".to_owned(),
                ..Default::default()
            },
            items: vec![Default::default(), Default::default()],
            status: "COMPLETED".to_owned(),
            risk_score: Some(Decimal::new(15, 1)),
        });

        let row = flatten(&detail).unwrap();
        assert_eq!(row.customer_email, "jane@example.com");
        assert_eq!(row.merchant_name, "Coffee Co");
        assert_eq!(row.item_count, 2);
        assert_eq!(row.risk_score, Some(Decimal::new(15, 1)));
    }

    #[test]
    fn rounds_amount_to_two_fractional_digits() {
        let mut detail = sample_detail();
        detail.amount = Decimal::new(100999, 3); // 100.999
        let row = flatten(&detail).unwrap();
        assert_eq!(row.amount, Decimal::new(10100, 2)); // 101.00, banker's rounding up
    }

    #[test]
    fn rejects_delimiter_in_description() {
        let mut detail = sample_detail();
        detail.description = "a|b".to_owned();
        let error = flatten(&detail).unwrap_err();
        match error {
            TransformError::DelimiterConflict { detail_id, field } => {
                assert_eq!(detail_id, 42);
                assert_eq!(field, "description");
            }
        }
    }

    #[test]
    fn rejects_delimiter_in_nested_merchant_name() {
        let mut detail = sample_detail();
        detail.transaction_data = Some(TransactionData {
            merchant: Merchant {
                name: "Bad|Merchant".to_owned(),
                ..Default::default()
            },
            ..Default::default()
        });
        assert!(flatten(&detail).is_err());
    }

    #[test]
    fn to_line_produces_pipe_delimited_text_for_relational_modes() {
        let row = flatten(&sample_detail()).unwrap();
        let line = row.to_line(ProcessorMode::Standard);
        assert_eq!(line.matches('|').count(), 7);
        assert_eq!(line, "SALE|42|ACC-1|Jane Doe|100.50|USD|coffee|20260102030405");

        assert_eq!(line, row.to_line(ProcessorMode::Enhanced));
    }

    #[test]
    fn to_line_appends_flattened_tail_for_streaming_jsonb_mode() {
        let mut detail = sample_detail();
        detail.transaction_data = Some(TransactionData {
            customer: Customer {
                email: "jane@example.com".to_owned(),
                ..Default::default()
            },
            merchant: Merchant {
                name: "Coffee Co".to_owned(),
                ..Default::default()
            },
            items: vec![Default::default()],
            status: "COMPLETED".to_owned(),
            risk_score: Some(Decimal::new(155, 1)),
        });
        let row = flatten(&detail).unwrap();
        let line = row.to_line(ProcessorMode::StreamingJsonb);
        assert_eq!(line.matches('|').count(), 12);
        assert!(line.ends_with("|jane@example.com|Coffee Co|1|COMPLETED|15.5"));
    }
}
