//! Consistent-hash ring
//!
//! Each node contributes `virtual_nodes` points at `xxh3("host:port#i")`.
//! A resource is owned by the node of the first point at or after its hash,
//! wrapping past the top of the ring. The ring is built once from a valid
//! configuration and never changes.

use std::fmt;

use tracing::info;
use xxhash_rust::xxh3::xxh3_64;

use crate::config::{ClusterConfig, Location, ResourceName};
use crate::error::{ClientError, ClientResult};

/// Immutable view of the cluster used for routing.
#[derive(Debug, Clone)]
pub struct Cluster {
    locations: Vec<Location>,
    /// `(point, index into locations)`, sorted
    ring: Vec<(u64, usize)>,
    virtual_nodes: u32,
}

impl Cluster {
    pub fn new(config: &ClusterConfig) -> ClientResult<Self> {
        config.validate().map_err(|reason| ClientError::Config { reason })?;

        let mut ring = Vec::with_capacity(config.nodes.len() * config.virtual_nodes as usize);
        for (idx, loc) in config.nodes.iter().enumerate() {
            for i in 0..config.virtual_nodes {
                ring.push((xxh3_64(format!("{}#{}", loc, i).as_bytes()), idx));
            }
        }
        // Ties (vanishingly rare) resolve by node index so the ring is deterministic
        ring.sort_unstable();

        Ok(Self {
            locations: config.nodes.clone(),
            ring,
            virtual_nodes: config.virtual_nodes,
        })
    }

    /// Hash used to place a resource on the ring.
    pub fn hash(name: &ResourceName) -> u64 {
        xxh3_64(name.as_bytes())
    }

    /// Node owning `name`.
    pub fn locate(&self, name: &ResourceName) -> &Location {
        let h = Self::hash(name);
        let pos = self.ring.partition_point(|&(point, _)| point < h);
        let (_, idx) = self.ring[pos % self.ring.len()];
        &self.locations[idx]
    }

    pub fn locations(&self) -> &[Location] {
        &self.locations
    }

    pub fn virtual_nodes(&self) -> u32 {
        self.virtual_nodes
    }

    /// Fraction of the hash space each node owns, in configuration order.
    pub fn ownership(&self) -> Vec<f64> {
        if let [(_, only)] = self.ring[..] {
            let mut shares = vec![0.0; self.locations.len()];
            shares[only] = 1.0;
            return shares;
        }
        let mut owned = vec![0u128; self.locations.len()];
        let mut prev = self.ring.last().map_or(0, |&(p, _)| p);
        for &(point, idx) in &self.ring {
            // Arc (prev, point] belongs to this point's node
            owned[idx] += point.wrapping_sub(prev) as u128;
            prev = point;
        }
        let total = u64::MAX as f64 + 1.0;
        owned.into_iter().map(|o| o as f64 / total).collect()
    }

    /// Log the ring summary.
    pub fn print(&self) {
        info!(cluster = %self, "cluster ring");
    }
}

impl fmt::Display for Cluster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "cluster: {} node(s), {} ring point(s)",
            self.locations.len(),
            self.ring.len()
        )?;
        for (loc, share) in self.locations.iter().zip(self.ownership()) {
            writeln!(f, "  {} owns {:.1}%", loc, share * 100.0)?;
        }
        Ok(())
    }
}
