//! The process-wide network client handle.
//!
//! Games address the kernel through a single process-wide handle: one call
//! site initializes it with the session configuration, everything else
//! borrows it. Re-initialization is deliberately a no-op — the second
//! caller gets the original instance unchanged — so a stray double-init
//! cannot silently reconfigure a running game.
//!
//! The handle is a lazily initialized cell guarded by a mutex; the kernel
//! itself stays single-threaded (callers serialize on the guard).
//!
//! # Examples
//!
//! ```
//! use bastion_lockstep::{initialize_network_client, network_client, shutdown_network_client, NetworkConfig};
//!
//! let mut client = initialize_network_client(NetworkConfig::default());
//! client.init();
//! assert!(client.is_started());
//! drop(client);
//!
//! assert!(network_client().is_some());
//! shutdown_network_client();
//! assert!(network_client().is_none());
//! ```

use parking_lot::{MappedMutexGuard, Mutex, MutexGuard};

use crate::config::NetworkConfig;
use crate::manager::NetworkManager;

static NETWORK_CLIENT: Mutex<Option<NetworkManager>> = Mutex::new(None);

/// Initializes the process-wide network client and returns a guard to it.
///
/// When a client already exists, the configuration is ignored and the
/// original instance is returned unchanged.
pub fn initialize_network_client(
    config: NetworkConfig,
) -> MappedMutexGuard<'static, NetworkManager> {
    let mut guard = NETWORK_CLIENT.lock();
    if guard.is_none() {
        *guard = Some(NetworkManager::new(config));
    }
    MutexGuard::map(guard, |slot| match slot {
        Some(manager) => manager,
        // The branch above just filled the cell.
        None => unreachable!(),
    })
}

/// Borrows the process-wide network client, if one has been initialized.
#[must_use]
pub fn network_client() -> Option<MappedMutexGuard<'static, NetworkManager>> {
    let guard = NETWORK_CLIENT.lock();
    if guard.is_none() {
        return None;
    }
    Some(MutexGuard::map(guard, |slot| match slot {
        Some(manager) => manager,
        None => unreachable!(),
    }))
}

/// Tears down the process-wide network client.
pub fn shutdown_network_client() {
    *NETWORK_CLIENT.lock() = None;
}

#[cfg(test)]
#[allow(clippy::panic, clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serial_test::serial;
    use web_time::Duration;

    #[test]
    #[serial]
    fn second_init_returns_original_unchanged() {
        shutdown_network_client();

        let first_config = NetworkConfig {
            frame_rate: 60,
            ..NetworkConfig::default()
        };
        {
            let client = initialize_network_client(first_config);
            assert_eq!(client.frame_rate(), 60);
        }

        // A different configuration does not reconfigure the client.
        let second_config = NetworkConfig {
            frame_rate: 120,
            disconnect_timeout: Duration::from_secs(1),
            ..NetworkConfig::default()
        };
        {
            let client = initialize_network_client(second_config);
            assert_eq!(client.frame_rate(), 60);
        }

        shutdown_network_client();
    }

    #[test]
    #[serial]
    fn accessor_reflects_lifecycle() {
        shutdown_network_client();
        assert!(network_client().is_none());

        {
            let mut client = initialize_network_client(NetworkConfig::default());
            client.init();
        }
        assert!(network_client().unwrap().is_started());

        shutdown_network_client();
        assert!(network_client().is_none());
    }
}
