//! Payer-name to customer resolution.

use sqlx::PgPool;

use jonche_common::error::AppError;

/// Result of resolving a payer name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchOutcome {
    /// Exactly one active customer carries the name.
    Matched(i64),
    Unmatched,
    /// Several active customers share the name; none is picked. Carries the
    /// number of candidates.
    Ambiguous(usize),
}

/// Trim, collapse inner whitespace and upper-case a name.
///
/// Used for stored payer names. Matching runs the equivalent normalization in
/// Postgres on both sides so case folding never differs between them.
pub fn normalize_name(raw: &str) -> String {
    raw.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_uppercase()
}

/// Resolves inbound payment notices to customers by exact normalized name.
#[derive(Clone)]
pub struct PaymentMatcher {
    pool: PgPool,
}

impl PaymentMatcher {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn resolve(&self, payer_name: &str) -> Result<MatchOutcome, AppError> {
        let name = normalize_name(payer_name);
        if name.is_empty() {
            return Ok(MatchOutcome::Unmatched);
        }

        let candidates: Option<(i64, i64)> = sqlx::query_as(
            r#"
            SELECT id, COUNT(*) OVER ()
            FROM customers
            WHERE active
              AND UPPER(btrim(regexp_replace(name, '\s+', ' ', 'g')))
                = UPPER(btrim(regexp_replace($1, '\s+', ' ', 'g')))
            ORDER BY id
            LIMIT 1
            "#,
        )
        .bind(payer_name)
        .fetch_optional(&self.pool)
        .await?;

        let outcome = match candidates {
            None => MatchOutcome::Unmatched,
            Some((id, 1)) => MatchOutcome::Matched(id),
            Some((_, count)) => MatchOutcome::Ambiguous(count as usize),
        };

        tracing::debug!(payer = %name, outcome = ?outcome, "Payer name resolved");
        Ok(outcome)
    }
}
