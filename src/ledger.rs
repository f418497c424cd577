use serde::{Deserialize, Serialize};
use std::{fmt, num::ParseIntError, sync::Arc};
use thiserror::Error;
use tokio::sync::Mutex;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
    Send,
    Receive,
}

impl fmt::Display for TransactionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransactionKind::Send => write!(f, "send"),
            TransactionKind::Receive => write!(f, "receive"),
        }
    }
}

/// One entry of the ledger.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Cube {
    pub index: u64,
    /// Balance right after this cube was applied
    pub balance: i64,
    /// `None` only for genesis
    #[serde(rename = "type")]
    pub kind: Option<TransactionKind>,
    pub amount: u64,
}

impl Cube {
    pub fn genesis() -> Self {
        Cube {
            index: 0,
            balance: 0,
            kind: None,
            amount: 0,
        }
    }

    /// Derives the cube that follows `self` after a transaction of
    /// `amount`. Overdraft is allowed, only `i64` overflow is rejected.
    pub fn apply_transaction(
        &self,
        kind: TransactionKind,
        amount: u64,
    ) -> Result<Cube, LedgerError> {
        let delta = i64::try_from(amount).map_err(|_| LedgerError::Overflow {
            balance: self.balance,
            kind,
            amount,
        })?;
        let balance = match kind {
            TransactionKind::Send => self.balance.checked_sub(delta),
            TransactionKind::Receive => self.balance.checked_add(delta),
        }
        .ok_or(LedgerError::Overflow {
            balance: self.balance,
            kind,
            amount,
        })?;

        Ok(Cube {
            index: self.index + 1,
            balance,
            kind: Some(kind),
            amount,
        })
    }
}

impl fmt::Display for Cube {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            Some(kind) => write!(
                f,
                "{{index: {}, balance: {}, type: {}, amount: {}}}",
                self.index, self.balance, kind, self.amount
            ),
            None => write!(f, "{{index: {}, balance: {}}}", self.index, self.balance),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    #[error("{kind} of {amount} overflows balance {balance}")]
    Overflow {
        balance: i64,
        kind: TransactionKind,
        amount: u64,
    },
    /// Only ever raised by `Ledger::verify`. Seeing it means a bug.
    #[error("ledger invariant violated at index {index}: {reason}")]
    Invariant { index: u64, reason: String },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmountError {
    #[error("amount is empty")]
    Empty,
    #[error("amount {0} is negative")]
    Negative(i128),
    #[error("`{text}` is not an integer amount")]
    Invalid {
        text: String,
        #[source]
        source: ParseIntError,
    },
}

/// Parses chat text as a transaction amount.
pub fn parse_amount(text: &str) -> Result<u64, AmountError> {
    let text = text.trim();
    if text.is_empty() {
        return Err(AmountError::Empty);
    }
    let value = text.parse::<i128>().map_err(|source| AmountError::Invalid {
        text: text.to_string(),
        source,
    })?;
    if value < 0 {
        return Err(AmountError::Negative(value));
    }
    // in range of i128 but not u64, let u64 parsing produce the error
    u64::try_from(value).or_else(|_| {
        text.parse::<u64>().map_err(|source| AmountError::Invalid {
            text: text.to_string(),
            source,
        })
    })
}

/// Append-only balance history shared by the dispatcher and the command
/// loop. Every transition happens under a single lock.
#[derive(Clone, Debug)]
pub struct Ledger {
    cubes: Arc<Mutex<Vec<Cube>>>,
}

impl Default for Ledger {
    fn default() -> Self {
        Self::new()
    }
}

impl Ledger {
    pub fn new() -> Self {
        Self {
            cubes: Arc::new(Mutex::new(vec![Cube::genesis()])),
        }
    }

    /// Reads the last cube, derives the next one and appends it as one unit.
    pub async fn apply(&self, kind: TransactionKind, amount: u64) -> Result<Cube, LedgerError> {
        let mut cubes = self.cubes.lock().await;
        let last = cubes.last().cloned().unwrap_or_else(Cube::genesis);
        let next = last.apply_transaction(kind, amount)?;
        cubes.push(next.clone());
        Ok(next)
    }

    pub async fn snapshot(&self) -> Vec<Cube> {
        self.cubes.lock().await.clone()
    }

    pub async fn last(&self) -> Cube {
        self.cubes
            .lock()
            .await
            .last()
            .cloned()
            .unwrap_or_else(Cube::genesis)
    }

    pub async fn balance(&self) -> i64 {
        self.last().await.balance
    }

    pub async fn len(&self) -> usize {
        self.cubes.lock().await.len()
    }

    /// Checks genesis, index continuity and balance arithmetic over the
    /// whole history.
    pub async fn verify(&self) -> Result<(), LedgerError> {
        verify_cubes(&self.cubes.lock().await)
    }
}

pub fn verify_cubes(cubes: &[Cube]) -> Result<(), LedgerError> {
    match cubes.first() {
        Some(first) if *first == Cube::genesis() => {}
        Some(first) => {
            return Err(LedgerError::Invariant {
                index: first.index,
                reason: "first cube is not genesis".to_string(),
            })
        }
        None => {
            return Err(LedgerError::Invariant {
                index: 0,
                reason: "ledger is empty".to_string(),
            })
        }
    }

    for pair in cubes.windows(2) {
        let (prev, cube) = (&pair[0], &pair[1]);
        let kind = cube.kind.ok_or_else(|| LedgerError::Invariant {
            index: cube.index,
            reason: "non-genesis cube without transaction type".to_string(),
        })?;
        let expected = prev.apply_transaction(kind, cube.amount)?;
        if expected.index != cube.index {
            return Err(LedgerError::Invariant {
                index: cube.index,
                reason: format!("expected index {}", expected.index),
            });
        }
        if expected.balance != cube.balance {
            return Err(LedgerError::Invariant {
                index: cube.index,
                reason: format!(
                    "expected balance {} but found {}",
                    expected.balance, cube.balance
                ),
            });
        }
    }
    Ok(())
}

/// Printable snapshot of the full sequence.
pub fn render(cubes: &[Cube]) -> String {
    let body = cubes
        .iter()
        .map(|c| c.to_string())
        .collect::<Vec<_>>()
        .join(" ");
    format!("[{}]", body)
}

/// How ledger snapshots are printed after each transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SnapshotFormat {
    #[default]
    Plain,
    Json,
}

impl SnapshotFormat {
    pub fn format(&self, cubes: &[Cube]) -> String {
        match self {
            SnapshotFormat::Plain => render(cubes),
            SnapshotFormat::Json => {
                serde_json::to_string(cubes).unwrap_or_else(|_| render(cubes))
            }
        }
    }

    pub async fn print(&self, ledger: &Ledger) {
        println!("{}", self.format(&ledger.snapshot().await));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{thread_rng, Rng};

    #[tokio::test]
    async fn worked_example() {
        let ledger = Ledger::new();
        ledger.apply(TransactionKind::Receive, 50).await.unwrap();
        ledger.apply(TransactionKind::Send, 20).await.unwrap();
        ledger.apply(TransactionKind::Receive, 5).await.unwrap();

        let cubes = ledger.snapshot().await;
        assert_eq!(
            cubes,
            vec![
                Cube::genesis(),
                Cube {
                    index: 1,
                    balance: 50,
                    kind: Some(TransactionKind::Receive),
                    amount: 50
                },
                Cube {
                    index: 2,
                    balance: 30,
                    kind: Some(TransactionKind::Send),
                    amount: 20
                },
                Cube {
                    index: 3,
                    balance: 35,
                    kind: Some(TransactionKind::Receive),
                    amount: 5
                },
            ]
        );
        assert_eq!(ledger.balance().await, 35);
        ledger.verify().await.unwrap();
    }

    #[test]
    fn apply_transaction_is_pure() {
        let cube = Cube {
            index: 4,
            balance: 10,
            kind: Some(TransactionKind::Send),
            amount: 3,
        };
        let before = cube.clone();
        let a = cube.apply_transaction(TransactionKind::Send, 7).unwrap();
        let b = cube.apply_transaction(TransactionKind::Send, 7).unwrap();
        assert_eq!(cube, before);
        assert_eq!(a, b);
        assert_eq!(a.index, 5);
        assert_eq!(a.balance, 3);
    }

    #[test]
    fn overdraft_is_permitted() {
        let next = Cube::genesis()
            .apply_transaction(TransactionKind::Send, 25)
            .unwrap();
        assert_eq!(next.balance, -25);
    }

    #[tokio::test]
    async fn overflow_leaves_ledger_untouched() {
        let ledger = Ledger::new();
        ledger
            .apply(TransactionKind::Receive, i64::MAX as u64)
            .await
            .unwrap();
        let err = ledger.apply(TransactionKind::Receive, 1).await.unwrap_err();
        assert!(matches!(err, LedgerError::Overflow { .. }));
        let err = ledger
            .apply(TransactionKind::Send, u64::MAX)
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::Overflow { .. }));
        assert_eq!(ledger.len().await, 2);
    }

    #[tokio::test]
    async fn random_sequences_keep_invariants() {
        let mut rng = thread_rng();
        for _ in 0..20 {
            let ledger = Ledger::new();
            let n = rng.gen_range(0..200);
            for _ in 0..n {
                let kind = if rng.gen_bool(0.5) {
                    TransactionKind::Send
                } else {
                    TransactionKind::Receive
                };
                ledger.apply(kind, rng.gen_range(0..10_000)).await.unwrap();
            }
            let cubes = ledger.snapshot().await;
            assert_eq!(cubes.len(), n + 1);
            for (i, cube) in cubes.iter().enumerate() {
                assert_eq!(cube.index, i as u64);
            }
            verify_cubes(&cubes).unwrap();
        }
    }

    #[tokio::test]
    async fn concurrent_sends_and_receives_are_serialized() {
        let ledger = Ledger::new();
        let (receives, sends) = (64u64, 48u64);

        let mut handles = Vec::new();
        for i in 0..receives {
            let ledger = ledger.clone();
            handles.push(tokio::spawn(async move {
                ledger.apply(TransactionKind::Receive, i + 1).await.unwrap();
            }));
        }
        for i in 0..sends {
            let ledger = ledger.clone();
            handles.push(tokio::spawn(async move {
                ledger.apply(TransactionKind::Send, i).await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let cubes = ledger.snapshot().await;
        assert_eq!(cubes.len() as u64, receives + sends + 1);
        verify_cubes(&cubes).unwrap();

        let received: i64 = (1..=receives as i64).sum();
        let sent: i64 = (0..sends as i64).sum();
        assert_eq!(ledger.balance().await, received - sent);
    }

    #[test]
    fn verify_catches_gaps_and_bad_balances() {
        let mut cubes = vec![
            Cube::genesis(),
            Cube::genesis()
                .apply_transaction(TransactionKind::Receive, 5)
                .unwrap(),
        ];
        verify_cubes(&cubes).unwrap();

        cubes[1].index = 2;
        assert!(matches!(
            verify_cubes(&cubes),
            Err(LedgerError::Invariant { .. })
        ));

        cubes[1].index = 1;
        cubes[1].balance = 6;
        assert!(matches!(
            verify_cubes(&cubes),
            Err(LedgerError::Invariant { .. })
        ));

        assert!(verify_cubes(&[]).is_err());
    }

    #[test]
    fn parse_amount_policy() {
        assert_eq!(parse_amount("42"), Ok(42));
        assert_eq!(parse_amount(" 7 \n"), Ok(7));
        assert_eq!(parse_amount("0"), Ok(0));
        assert_eq!(parse_amount(""), Err(AmountError::Empty));
        assert_eq!(parse_amount("-3"), Err(AmountError::Negative(-3)));
        assert!(matches!(
            parse_amount("abc"),
            Err(AmountError::Invalid { .. })
        ));
        assert!(matches!(
            parse_amount("12.5"),
            Err(AmountError::Invalid { .. })
        ));
        assert!(matches!(
            parse_amount("99999999999999999999999"),
            Err(AmountError::Invalid { .. })
        ));
    }

    #[test]
    fn render_lists_every_cube() {
        let cubes = vec![
            Cube::genesis(),
            Cube::genesis()
                .apply_transaction(TransactionKind::Receive, 50)
                .unwrap(),
        ];
        assert_eq!(
            render(&cubes),
            "[{index: 0, balance: 0} {index: 1, balance: 50, type: receive, amount: 50}]"
        );
        assert_eq!(
            SnapshotFormat::Json.format(&cubes),
            r#"[{"index":0,"balance":0,"type":null,"amount":0},{"index":1,"balance":50,"type":"receive","amount":50}]"#
        );
    }
}
