use grove_core::config::GroveConfig;
use grove_core::identity::IdentityStore;

use crate::commands::common::{format_timestamp, Paths};
use crate::error::CliError;

pub fn run_identity(name: Option<&str>, paths: &Paths) -> Result<(), CliError> {
    let config = GroveConfig::load(&paths.config_dir)?;
    let store = IdentityStore::new(&paths.config_dir);
    let identity = store.ensure_identity(name.or(config.device_name.as_deref()))?;

    println!("Device ID:    {}", identity.device_id());
    println!("Device name:  {}", identity.device_name());
    println!("Fingerprint:  {}", identity.fingerprint());
    println!("Created:      {}", format_timestamp(identity.created_at()));
    println!("Identity:     {}", store.identity_path().display());
    println!("Certificates: {}", store.certs_dir().display());
    Ok(())
}
