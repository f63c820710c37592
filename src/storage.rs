//! Secret storage in the OS credential store.
//!
//! The harvest key can live in the keyring instead of the environment, so it
//! never appears in process listings or unit files. Windows uses the
//! credential manager, macOS the Keychain, Linux the kernel keyutils store
//! (all via the `keyring` crate).

use keyring::Entry;
use tracing::{info, warn};
use zeroize::Zeroizing;

const SERVICE_NAME: &str = "pisonet-ledger";

pub const KEY_HARVEST_KEY: &str = "harvest_key";

/// Retrieve a single credential from the OS keyring. Returns `None` when the
/// entry does not exist (or the platform returns a "not found" error).
pub fn get_credential(key: &str) -> Option<Zeroizing<String>> {
    let entry = match Entry::new(SERVICE_NAME, key) {
        Ok(e) => e,
        Err(e) => {
            warn!(key, error = %e, "keyring: failed to create entry");
            return None;
        }
    };
    match entry.get_password() {
        Ok(pw) => Some(Zeroizing::new(pw)),
        Err(keyring::Error::NoEntry) => None,
        Err(e) => {
            warn!(key, error = %e, "keyring: failed to read credential");
            None
        }
    }
}

/// Store a credential in the OS keyring.
pub fn set_credential(key: &str, value: &str) -> Result<(), keyring::Error> {
    let entry = Entry::new(SERVICE_NAME, key)?;
    entry.set_password(value)?;
    info!(key, "keyring: credential stored");
    Ok(())
}

/// Delete a credential from the OS keyring. Silently succeeds if the entry
/// does not exist.
pub fn delete_credential(key: &str) -> Result<(), keyring::Error> {
    let entry = Entry::new(SERVICE_NAME, key)?;
    match entry.delete_credential() {
        Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
        Err(e) => Err(e),
    }
}
