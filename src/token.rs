use chrono::Utc;
use rusqlite::{Connection, OptionalExtension};
use uuid::Uuid;

use crate::calc::CalcError;

pub const TOKEN_LEN: usize = 12;
const TOKEN_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// Fixed-width uppercase code from the thread-local CSPRNG.
pub fn generate_token() -> String {
    use rand::Rng;
    let mut rng = rand::rng();
    (0..TOKEN_LEN)
        .map(|_| {
            let idx = rng.random_range(0..TOKEN_ALPHABET.len());
            TOKEN_ALPHABET[idx] as char
        })
        .collect()
}

/// Tokens are stored uppercase; lookups accept any casing and surrounding
/// whitespace.
pub fn normalize_token(raw: &str) -> String {
    raw.trim().to_ascii_uppercase()
}

#[derive(Debug, Clone)]
pub struct IssuedToken {
    pub token: String,
    pub max_uses: i64,
    pub uses_count: i64,
    pub already_existed: bool,
}

/// Idempotent per (student, term): re-issuing returns the existing token
/// untouched. The UNIQUE(token) constraint guards the astronomically
/// unlikely collision; retry once on it.
pub fn issue_token(
    conn: &Connection,
    student_id: &str,
    term_id: &str,
    max_uses: i64,
) -> Result<IssuedToken, CalcError> {
    let existing: Option<(String, i64, i64)> = conn
        .query_row(
            "SELECT token, max_uses, uses_count FROM result_tokens
             WHERE student_id = ? AND term_id = ?",
            (student_id, term_id),
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .optional()
        .map_err(|e| CalcError::new("db_query_failed", e.to_string()))?;
    if let Some((token, max_uses, uses_count)) = existing {
        return Ok(IssuedToken {
            token,
            max_uses,
            uses_count,
            already_existed: true,
        });
    }

    let now = Utc::now().to_rfc3339();
    for _ in 0..2 {
        let token = generate_token();
        let inserted = conn.execute(
            "INSERT INTO result_tokens(id, student_id, term_id, token, max_uses, uses_count, created_at)
             VALUES(?, ?, ?, ?, ?, 0, ?)
             ON CONFLICT(token) DO NOTHING",
            (
                Uuid::new_v4().to_string(),
                student_id,
                term_id,
                &token,
                max_uses,
                &now,
            ),
        )
        .map_err(|e| CalcError::new("db_insert_failed", e.to_string()))?;
        if inserted == 1 {
            return Ok(IssuedToken {
                token,
                max_uses,
                uses_count: 0,
                already_existed: false,
            });
        }
    }
    Err(CalcError::new(
        "db_insert_failed",
        "could not allocate a unique token",
    ))
}

#[derive(Debug, Clone)]
pub enum RedeemOutcome {
    Redeemed {
        student_id: String,
        term_id: String,
        uses_count: i64,
        max_uses: i64,
    },
    Exhausted,
    NotFound,
}

/// One conditional UPDATE consumes a use; two concurrent redemptions of a
/// token with a single use left cannot both pass, because the guard and the
/// increment are the same statement.
pub fn redeem_token(conn: &Connection, raw_token: &str) -> Result<RedeemOutcome, CalcError> {
    let token = normalize_token(raw_token);
    if token.len() != TOKEN_LEN || !token.bytes().all(|b| TOKEN_ALPHABET.contains(&b)) {
        return Err(CalcError::new(
            "bad_params",
            format!("token must be {} letters/digits", TOKEN_LEN),
        ));
    }

    let updated = conn
        .execute(
            "UPDATE result_tokens SET uses_count = uses_count + 1
             WHERE token = ? AND uses_count < max_uses",
            [&token],
        )
        .map_err(|e| CalcError::new("db_query_failed", e.to_string()))?;

    let row: Option<(String, String, i64, i64)> = conn
        .query_row(
            "SELECT student_id, term_id, uses_count, max_uses
             FROM result_tokens WHERE token = ?",
            [&token],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
        )
        .optional()
        .map_err(|e| CalcError::new("db_query_failed", e.to_string()))?;

    match (updated, row) {
        (1, Some((student_id, term_id, uses_count, max_uses))) => Ok(RedeemOutcome::Redeemed {
            student_id,
            term_id,
            uses_count,
            max_uses,
        }),
        (_, Some(_)) => Ok(RedeemOutcome::Exhausted),
        (_, None) => Ok(RedeemOutcome::NotFound),
    }
}
