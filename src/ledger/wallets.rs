//! User wallet registry table.

use alloy::primitives::Address;
use rusqlite::{params, OptionalExtension, Row};

use crate::ledger::models::UserWallet;
use crate::ledger::store::{address_key, parsed, timestamp, to_millis, Ledger, LedgerError, LedgerResult};

const WALLET_COLUMNS: &str =
    "user_id, address, public_key, encrypted_private_key, derivation_path, created_at";

fn wallet_from_row(row: &Row<'_>) -> rusqlite::Result<UserWallet> {
    Ok(UserWallet {
        user_id: row.get(0)?,
        address: parsed(row, 1)?,
        public_key: row.get(2)?,
        encrypted_private_key: row.get(3)?,
        derivation_path: row.get(4)?,
        created_at: timestamp(row, 5)?,
    })
}

impl Ledger {
    /// Store a newly derived wallet.
    ///
    /// Re-inserting the same user/address pair is a no-op. An address owned by
    /// another user, or a second address for the same user, is a conflict.
    pub fn insert_wallet(&self, wallet: &UserWallet) -> LedgerResult<()> {
        let address = address_key(&wallet.address);
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;

            let owner: Option<String> = tx
                .query_row(
                    "SELECT user_id FROM user_wallets WHERE address = ?1",
                    params![address],
                    |row| row.get(0),
                )
                .optional()?;
            match owner {
                Some(owner) if owner == wallet.user_id => return Ok(()),
                Some(owner) => {
                    return Err(LedgerError::Conflict(format!(
                        "address {address} already belongs to user {owner}"
                    )))
                }
                None => {}
            }

            let existing: Option<String> = tx
                .query_row(
                    "SELECT address FROM user_wallets WHERE user_id = ?1",
                    params![wallet.user_id],
                    |row| row.get(0),
                )
                .optional()?;
            if let Some(existing) = existing {
                return Err(LedgerError::Conflict(format!(
                    "user {} already has wallet {existing}",
                    wallet.user_id
                )));
            }

            tx.execute(
                "INSERT INTO user_wallets (user_id, address, public_key, encrypted_private_key, derivation_path, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    wallet.user_id,
                    address,
                    wallet.public_key,
                    wallet.encrypted_private_key,
                    wallet.derivation_path,
                    to_millis(wallet.created_at),
                ],
            )?;
            tx.commit()?;
            Ok(())
        })
    }

    pub fn wallet_by_user(&self, user_id: &str) -> LedgerResult<Option<UserWallet>> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT {WALLET_COLUMNS} FROM user_wallets WHERE user_id = ?1"),
                params![user_id],
                wallet_from_row,
            )
            .optional()
        })
    }

    pub fn wallet_by_address(&self, address: &Address) -> LedgerResult<Option<UserWallet>> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT {WALLET_COLUMNS} FROM user_wallets WHERE address = ?1"),
                params![address_key(address)],
                wallet_from_row,
            )
            .optional()
        })
    }

    pub fn wallet_count(&self) -> LedgerResult<usize> {
        self.with_conn(|conn| {
            conn.query_row("SELECT COUNT(*) FROM user_wallets", [], |row| row.get::<_, i64>(0))
        })
        .map(|count| count as usize)
    }

    /// All registered wallets, oldest first.
    pub fn list_wallets(&self) -> LedgerResult<Vec<UserWallet>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {WALLET_COLUMNS} FROM user_wallets ORDER BY created_at, user_id"
            ))?;
            let rows = stmt.query_map([], wallet_from_row)?;
            rows.collect()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn wallet(user_id: &str, byte: u8) -> UserWallet {
        UserWallet {
            user_id: user_id.to_string(),
            address: Address::repeat_byte(byte),
            public_key: "04aa".to_string(),
            encrypted_private_key: "v1:00:00".to_string(),
            derivation_path: "m/44'/60'/1'/2/3".to_string(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_insert_and_lookup() {
        let ledger = Ledger::open_in_memory().unwrap();
        let w = wallet("alice", 0xab);
        ledger.insert_wallet(&w).unwrap();

        let by_user = ledger.wallet_by_user("alice").unwrap().unwrap();
        assert_eq!(by_user.address, w.address);

        let by_address = ledger.wallet_by_address(&w.address).unwrap().unwrap();
        assert_eq!(by_address.user_id, "alice");
        assert!(ledger.wallet_by_user("bob").unwrap().is_none());
    }

    #[test]
    fn test_reinsert_is_noop() {
        let ledger = Ledger::open_in_memory().unwrap();
        let w = wallet("alice", 0x01);
        ledger.insert_wallet(&w).unwrap();
        ledger.insert_wallet(&w).unwrap();
        assert_eq!(ledger.list_wallets().unwrap().len(), 1);
        assert_eq!(ledger.wallet_count().unwrap(), 1);
    }

    #[test]
    fn test_address_collision_rejected() {
        let ledger = Ledger::open_in_memory().unwrap();
        ledger.insert_wallet(&wallet("alice", 0x01)).unwrap();

        let err = ledger.insert_wallet(&wallet("bob", 0x01)).unwrap_err();
        assert!(matches!(err, LedgerError::Conflict(_)));

        let err = ledger.insert_wallet(&wallet("alice", 0x02)).unwrap_err();
        assert!(matches!(err, LedgerError::Conflict(_)));
    }
}
