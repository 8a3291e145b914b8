// src/schema.rs

use std::{fs, path::Path};

use anyhow::Error;
use plugin_api::message::{Description, Fingerprint, InvocationRequest, InvocationResponse};
use schemars::{schema_for, Schema};

use crate::{broker::BrokerStatus, config::CoordinatorConfig};

/// The entry point invoked by `main.rs` for `Commands::Schema`. Writes one
/// `<name>.schema.json` per wire or config type into `out_dir`.
pub fn write_schema(out_dir: &Path) -> Result<Vec<String>, Error> {
    fs::create_dir_all(out_dir)?;

    let schemas: [(&str, Schema); 6] = [
        ("fingerprint", schema_for!(Fingerprint)),
        ("description", schema_for!(Description)),
        ("invocation-request", schema_for!(InvocationRequest)),
        ("invocation-response", schema_for!(InvocationResponse)),
        ("broker-status", schema_for!(BrokerStatus)),
        ("config", schema_for!(CoordinatorConfig)),
    ];

    let mut written = Vec::with_capacity(schemas.len());
    for (name, schema) in schemas {
        let filename = format!("{name}.schema.json");
        let json_text = serde_json::to_string_pretty(&schema)?;
        fs::write(out_dir.join(&filename), json_text)?;
        written.push(filename);
    }
    Ok(written)
}
