//! Redis transport for the journal store.

use parking_lot::Mutex;
use redis::Commands;

use super::journal::JournalBackend;
use crate::error::{Error, Result};

/// A journal kept in one Redis list. `RPUSH` is atomic, so concurrent
/// workers never interleave inside a line.
pub struct RedisJournal {
    conn: Mutex<redis::Connection>,
    key: String,
}

impl RedisJournal {
    /// Connects to `url`. The list key is taken from the URL fragment
    /// (`redis://host/0#my-ledger`), defaulting to `hpdispatch:journal`.
    ///
    /// # Errors
    ///
    /// Returns a ledger error if the server cannot be reached.
    pub fn connect(url: &str) -> Result<Self> {
        let (url, key) = url.split_once('#').unwrap_or((url, "hpdispatch:journal"));
        let client = redis::Client::open(url).map_err(|e| Error::Storage(e.to_string()))?;
        let conn = client
            .get_connection()
            .map_err(|e| Error::Storage(e.to_string()))?;
        Ok(Self {
            conn: Mutex::new(conn),
            key: key.to_string(),
        })
    }
}

impl JournalBackend for RedisJournal {
    fn append(&self, lines: &[String]) -> Result<()> {
        let mut conn = self.conn.lock();
        conn.rpush::<_, _, ()>(&self.key, lines)
            .map_err(|e| Error::Storage(e.to_string()))
    }

    fn read_from(&self, offset: usize) -> Result<Vec<String>> {
        let start = isize::try_from(offset).map_err(|e| Error::Storage(e.to_string()))?;
        let mut conn = self.conn.lock();
        conn.lrange(&self.key, start, -1)
            .map_err(|e| Error::Storage(e.to_string()))
    }
}
