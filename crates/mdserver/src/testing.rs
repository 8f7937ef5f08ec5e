//! Test-only construction helpers, including the environment toggle that
//! picks which server flavor a test suite runs against.

use std::{
    path::PathBuf,
    sync::Arc,
};

use metadata::{
    testing::StaticKeyDirectory,
    BincodeCodec,
};
use runtime::Runtime;

use crate::{
    memory_store::MemoryServerStore,
    server::MetadataServer,
    sqlite_store::SqliteServerStore,
};

/// Environment variable selecting the server flavor for tests:
/// `mem` (default) for the in-memory shim, `dir:<path>` for an on-disk
/// server rooted at `<path>`. Anything else is treated as a remote address,
/// which this build does not speak to.
pub const MD_SERVER_ENV: &str = "VEILFS_MD_SERVER";

pub fn server_from_env<RT: Runtime>(
    rt: RT,
) -> anyhow::Result<MetadataServer<RT, BincodeCodec>> {
    let selector: String = cmd_util::env::env_config(MD_SERVER_ENV, "mem".to_string());
    let key_directory = Arc::new(StaticKeyDirectory::allow_all());
    match selector.as_str() {
        "mem" => Ok(MetadataServer::new(
            rt,
            BincodeCodec::new(),
            key_directory,
            Box::new(MemoryServerStore::new()),
        )),
        s => {
            if let Some(path) = s.strip_prefix("dir:") {
                let store = SqliteServerStore::new(&PathBuf::from(path))?;
                return Ok(MetadataServer::new(
                    rt,
                    BincodeCodec::new(),
                    key_directory,
                    Box::new(store),
                ));
            }
            anyhow::bail!("remote metadata server {s:?} is not reachable from tests");
        },
    }
}
