//
// Copyright 2025 Rendezvous RTC Contributors
// SPDX-License-Identifier: AGPL-3.0-only
//

//! Wrapper around `std::sync::Mutex::lock()` that converts a poisoned
//! mutex into a labeled error instead of panicking.

use std::sync::{Mutex, MutexGuard};

use crate::{common::Result, error::ClientError};

pub struct NamedMutex<T: ?Sized> {
    /// Human readable label for the mutex, used in the poison error.
    label: &'static str,
    mutex: Mutex<T>,
}

impl<T> NamedMutex<T> {
    pub fn new(t: T, label: &'static str) -> NamedMutex<T> {
        NamedMutex {
            mutex: Mutex::new(t),
            label,
        }
    }

    pub fn lock(&self) -> Result<MutexGuard<'_, T>> {
        match self.mutex.lock() {
            Ok(v) => Ok(v),
            Err(_) => Err(ClientError::Poisoned(self.label).into()),
        }
    }
}
