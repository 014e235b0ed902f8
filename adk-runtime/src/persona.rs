// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Persona resolution: one core binary can host several applications,
//! each described by an entry in a JSON persona file. Lookup maps a
//! persona id (or the file's default) to its manifest URL and partner
//! identity.

use adk_cache::fs::{DirectoryRoot, Filesystem, FsError};
use serde::Deserialize;
use std::io::Read;
use thiserror::Error;
use tracing::{error, info};

#[derive(Debug, Deserialize)]
struct PersonaFile {
    v1: PersonaFileV1,
}

#[derive(Debug, Deserialize)]
struct PersonaFileV1 {
    default_persona: String,
    personas: Vec<PersonaEntry>,
}

#[derive(Debug, Clone, Deserialize)]
struct PersonaEntry {
    id: String,
    manifest_url: String,
    partner_name: String,
    partner_guid: String,
    #[serde(default)]
    error_message: Option<String>,
}

/// A resolved persona.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersonaMapping {
    pub id: String,
    pub manifest_url: String,
    pub partner_name: String,
    pub partner_guid: String,
    /// Shown by the host when the manifest cannot be loaded.
    pub fallback_error_message: Option<String>,
}

#[derive(Debug, Error)]
pub enum PersonaError {
    #[error("persona file unreadable: {0}")]
    Fs(#[from] FsError),
    #[error("persona file rejected: {0}")]
    Invalid(#[from] serde_json::Error),
    #[error("default persona id is empty")]
    EmptyDefaultPersona,
    #[error("no persona matches id {0:?}")]
    NoMatch(String),
}

/// Reads `file` from the application root and resolves `requested_id`.
/// An empty id selects the file's `default_persona`. Any missing
/// required field at any layer fails the lookup.
pub fn lookup_persona(
    fs: &Filesystem,
    file: &str,
    requested_id: &str,
) -> Result<PersonaMapping, PersonaError> {
    info!(file, requested_id, "resolving persona mapping");

    let mut contents = String::new();
    fs.open_read(DirectoryRoot::AppRoot, file)?
        .read_to_string(&mut contents)
        .map_err(FsError::from)?;
    let parsed: PersonaFile = serde_json::from_str(&contents)?;

    let id = if requested_id.is_empty() {
        if parsed.v1.default_persona.is_empty() {
            error!(file, "default_persona is required but empty");
            return Err(PersonaError::EmptyDefaultPersona);
        }
        info!(default_persona = %parsed.v1.default_persona, "using default persona id");
        parsed.v1.default_persona.clone()
    } else {
        requested_id.to_owned()
    };

    let entry = parsed
        .v1
        .personas
        .into_iter()
        .find(|entry| entry.id == id)
        .ok_or_else(|| {
            error!(file, id = %id, "no matching persona entry");
            PersonaError::NoMatch(id.clone())
        })?;

    info!(manifest_url = %entry.manifest_url, "resolved persona");
    Ok(PersonaMapping {
        id: entry.id,
        manifest_url: entry.manifest_url,
        partner_name: entry.partner_name,
        partner_guid: entry.partner_guid,
        fallback_error_message: entry.error_message,
    })
}
