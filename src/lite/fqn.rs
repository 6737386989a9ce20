//
// Copyright 2025 Rendezvous RTC Contributors
// SPDX-License-Identifier: AGPL-3.0-only
//

//! The fully qualified service name: `<reverse-dns-name>@<semver>`.

use std::fmt;

use lazy_static::lazy_static;
use regex::Regex;

use crate::{common::Result, error::ClientError};

lazy_static! {
    static ref NAME_RE: Regex =
        Regex::new(r"^[a-z0-9]([a-z0-9-]*[a-z0-9])?(\.[a-z0-9]([a-z0-9-]*[a-z0-9])?)+$")
            .expect("fqn name regex");
    static ref VERSION_RE: Regex =
        Regex::new(r"^[0-9]+\.[0-9]+\.[0-9]+(-[a-z0-9.-]+)?$").expect("fqn version regex");
    static ref USERNAME_RE: Regex =
        Regex::new(r"^[a-z0-9_][a-z0-9_-]{1,30}[a-z0-9_]$").expect("username regex");
}

const NAME_MIN_LEN: usize = 3;
const NAME_MAX_LEN: usize = 128;

/// A parsed service name. `Display` renders the wire form.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Fqn {
    name: String,
    version: String,
}

impl Fqn {
    pub fn new(name: &str, version: &str) -> Result<Self> {
        if name.len() < NAME_MIN_LEN || name.len() > NAME_MAX_LEN {
            return Err(ClientError::Validation(format!(
                "service name length must be {}-{}, got {}",
                NAME_MIN_LEN,
                NAME_MAX_LEN,
                name.len()
            ))
            .into());
        }
        if !NAME_RE.is_match(name) {
            return Err(
                ClientError::Validation(format!("bad service name: {:?}", name)).into(),
            );
        }
        if !VERSION_RE.is_match(version) {
            return Err(
                ClientError::Validation(format!("bad service version: {:?}", version)).into(),
            );
        }
        Ok(Self {
            name: name.to_string(),
            version: version.to_string(),
        })
    }

    pub fn parse(fqn: &str) -> Result<Self> {
        match fqn.split_once('@') {
            Some((name, version)) => Self::new(name, version),
            None => Err(ClientError::Validation(format!(
                "fqn must be <name>@<version>, got {:?}",
                fqn
            ))
            .into()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> &str {
        &self.version
    }
}

impl fmt::Display for Fqn {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.version)
    }
}

pub fn validate_username(username: &str) -> Result<()> {
    if USERNAME_RE.is_match(username) {
        Ok(())
    } else {
        Err(ClientError::Validation(format!("bad username: {:?}", username)).into())
    }
}
