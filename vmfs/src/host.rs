/*
 * vmfs - a user-space driver for the VMFS cluster filesystem
 *
 * This program is free software: you can redistribute it and/or modify it
 * under the terms of the GNU General Public License as published by the
 * Free Software Foundation, either version 3 of the License, or (at your
 * option) any later version.
 *
 * This program is distributed in the hope that it will be useful, but
 * WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the GNU General
 * Public License for more details.
 *
 * You should have received a copy of the GNU General Public License along
 * with this program. If not, see <https://www.gnu.org/licenses/>.
 */

//! Process-wide host identity.
//!
//! The UUID and start time identify this process as a heartbeat owner.
//! Both are immutable for the life of the process: build once at the first
//! [`crate::fs::Filesystem::open`] and pass the handle down, never reach
//! for a thread-local or a global.

use std::time::Instant;
use uuid::Uuid;

#[derive(Debug, Clone, Copy)]
pub struct HostIdentity {
    pub uuid: [u8; 16],
    started_at: Instant,
}

impl HostIdentity {
    pub fn new() -> Self {
        HostIdentity {
            uuid: *Uuid::new_v4().as_bytes(),
            started_at: Instant::now(),
        }
    }

    /// Microsecond uptime, the unit every heartbeat/metadata-header field
    /// expects.
    pub fn uptime_usec(&self) -> u64 {
        self.started_at.elapsed().as_micros() as u64
    }
}

impl Default for HostIdentity {
    fn default() -> Self {
        Self::new()
    }
}
