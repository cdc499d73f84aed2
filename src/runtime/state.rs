//! Persisted FQDN state
//!
//! The state file maps policy name to selector to the sets that backed the
//! selector on the last reconcile. It is read back on start-up so set names
//! and addresses survive a restart until DNS traffic refreshes them.

use std::{
    collections::BTreeMap,
    ffi::OsString,
    io::ErrorKind,
    path::{Path, PathBuf},
};

use crate::{error::NftwallError, net::IpSet, policy::FqdnState};

pub type PolicyStates = BTreeMap<String, FqdnState>;

/// Read the state file; a missing file yields an empty state
pub fn load_state(path: &Path) -> Result<PolicyStates, NftwallError> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(PolicyStates::new()),
        Err(err) => return Err(err.into()),
    };
    serde_json::from_str(&content).map_err(|source| NftwallError::StateParse {
        path: PathBuf::from(path),
        source,
    })
}

/// Write the state file through a temporary file renamed into place
pub fn save_state(path: &Path, states: &PolicyStates) -> Result<(), NftwallError> {
    let json =
        serde_json::to_string_pretty(states).map_err(|source| NftwallError::StateEncode { source })?;

    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }
    let mut staged = OsString::from(path.as_os_str());
    staged.push(".tmp");
    std::fs::write(&staged, json)?;
    std::fs::rename(&staged, path)?;
    Ok(())
}

/// Every set of every policy, for seeding the DNS cache
pub fn restored_sets(states: &PolicyStates) -> Vec<IpSet> {
    states
        .values()
        .flat_map(|state| state.values())
        .flatten()
        .cloned()
        .collect()
}
