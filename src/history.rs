use crate::fs::ensure_directory_exists;
use crate::trade::{TradeEntry, TradeId};
use anyhow::Result;
use chrono::{DateTime, Utc};
use csv::*;
use serde::{Serialize, Serializer};
use std::{
    fs::{File, OpenOptions},
    path::Path,
};

#[derive(Debug)]
pub struct History {
    writer: Writer<File>,
}

impl History {
    pub fn new(path: &Path) -> Result<History> {
        ensure_directory_exists(&path)?;

        let writer = if path.exists() {
            let file = OpenOptions::new().append(true).open(path)?;
            WriterBuilder::new().has_headers(false).from_writer(file)
        } else {
            Writer::from_path(path)?
        };

        Ok(History { writer })
    }

    pub fn write(&mut self, trade: FinishedTrade) -> Result<()> {
        self.writer.serialize(trade)?;
        self.writer.flush()?;
        Ok(())
    }
}

/// One row per trade that reached a terminal state.
// If you change this then you need to think about versioning
#[derive(Debug, Clone, Serialize)]
pub struct FinishedTrade {
    /// When the terminal state was recorded.
    #[serde(serialize_with = "datetime_rfc3339")]
    pub utc_final_timestamp: DateTime<Utc>,
    pub id: TradeId,
    pub role: &'static str,
    pub final_state: &'static str,
    /// The foreign-chain value locked in the own contract, in satoshi.
    pub foreign_value_sat: u64,
    /// The foreign-chain value of the counterparty contract, in satoshi.
    pub counterparty_value_sat: u64,
    /// The native-chain amount, in the native chain's base unit.
    pub native_amount: u64,
}

impl From<&TradeEntry> for FinishedTrade {
    fn from(entry: &TradeEntry) -> Self {
        FinishedTrade {
            utc_final_timestamp: Utc::now(),
            id: entry.id(),
            role: entry.role.name(),
            final_state: entry.state.name(),
            foreign_value_sat: entry.own_htlc.value.as_sat(),
            counterparty_value_sat: entry.their_htlc.value.as_sat(),
            native_amount: entry.native.amount,
        }
    }
}

fn datetime_rfc3339<S>(
    value: &DateTime<Utc>,
    serializer: S,
) -> Result<<S as Serializer>::Ok, <S as Serializer>::Error>
where
    S: Serializer,
{
    serializer.serialize_str(&value.to_rfc3339())
}
