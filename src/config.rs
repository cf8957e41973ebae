// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

use crate::PartitionId;
use serde::{Deserialize, Serialize};

/// Per-node settings handed to [crate::Database::new]. Derives `Deserialize`
/// so an embedding process can load it from whatever format it likes; any
/// field left out takes its default.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// The partition this node serves. Must be unique in the cluster.
    pub partition: PartitionId,

    /// Upper bound on transactions the [crate::Scheduler] has admitted but
    /// not yet finished executing. Admission pauses at the bound.
    pub max_in_flight: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            partition: PartitionId(0),
            max_in_flight: 256,
        }
    }
}

impl Config {
    pub fn for_partition(partition: PartitionId) -> Self {
        Config {
            partition,
            ..Default::default()
        }
    }
}
