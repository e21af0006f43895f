//! Resource requirements and the scheduler's accounting ledger

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

/// Declared resource requirement of a job, or total capacity of the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resources {
    /// CPU cores
    #[serde(default = "default_cores")]
    pub cores: u32,
    /// Memory in bytes
    #[serde(default)]
    pub memory: u64,
    /// Scratch disk in bytes
    #[serde(default)]
    pub disk: u64,
}

fn default_cores() -> u32 {
    1
}

impl Resources {
    pub const fn new(cores: u32, memory: u64, disk: u64) -> Self {
        Self {
            cores,
            memory,
            disk,
        }
    }

    /// A requirement that consumes nothing; admitted immediately.
    pub const fn none() -> Self {
        Self::new(0, 0, 0)
    }

    /// Cores plus a suffixed memory string, the common two hints.
    ///
    /// ```rust
    /// use shardflow_engine::resources::Resources;
    ///
    /// let r = Resources::with_memory_str(8, "8G").unwrap();
    /// assert_eq!(r.cores, 8);
    /// assert_eq!(r.memory, 8 * 1024 * 1024 * 1024);
    /// ```
    pub fn with_memory_str(cores: u32, memory: &str) -> Result<Self> {
        Ok(Self::new(cores, parse_memory(memory)?, 0))
    }

    /// Whether this requirement fits inside `capacity` on every axis.
    pub fn fits_within(&self, capacity: &Resources) -> bool {
        self.cores <= capacity.cores && self.memory <= capacity.memory && self.disk <= capacity.disk
    }
}

impl Default for Resources {
    fn default() -> Self {
        Self::new(1, 0, 0)
    }
}

impl std::fmt::Display for Resources {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "cores={} memory={} disk={}",
            self.cores, self.memory, self.disk
        )
    }
}

/// Parse a memory amount with an optional binary suffix: "8G", "512M", "1024".
pub fn parse_memory(s: &str) -> Result<u64> {
    let s = s.trim();
    if s.is_empty() {
        return Err(EngineError::parse("Empty memory amount"));
    }

    let (digits, multiplier) = match s.as_bytes()[s.len() - 1].to_ascii_uppercase() {
        b'K' => (&s[..s.len() - 1], 1u64 << 10),
        b'M' => (&s[..s.len() - 1], 1u64 << 20),
        b'G' => (&s[..s.len() - 1], 1u64 << 30),
        b'T' => (&s[..s.len() - 1], 1u64 << 40),
        b'0'..=b'9' => (s, 1u64),
        _ => {
            return Err(EngineError::parse(format!(
                "Invalid memory amount: {}",
                s
            )))
        }
    };

    let value = digits
        .parse::<u64>()
        .map_err(|_| EngineError::parse(format!("Invalid memory amount: {}", s)))?;

    value
        .checked_mul(multiplier)
        .ok_or_else(|| EngineError::parse(format!("Memory amount overflows: {}", s)))
}

/// Resource accounting for the set of currently running jobs.
///
/// Mutated only from the scheduler's event loop (single writer), which is
/// what rules out both double-dispatch and over-commit.
#[derive(Debug)]
pub struct ResourceLedger {
    capacity: Resources,
    in_use: Resources,
}

impl ResourceLedger {
    pub fn new(capacity: Resources) -> Self {
        Self {
            capacity,
            in_use: Resources::none(),
        }
    }

    pub fn capacity(&self) -> &Resources {
        &self.capacity
    }

    pub fn in_use(&self) -> &Resources {
        &self.in_use
    }

    /// Reject a declared requirement that can never be satisfied, at
    /// graph-construction time, before it is ever dispatched.
    pub fn validate(&self, request: &Resources) -> Result<()> {
        if request.fits_within(&self.capacity) {
            Ok(())
        } else {
            Err(EngineError::ResourceExceeded(format!(
                "requested [{}] but worker capacity is [{}]",
                request, self.capacity
            )))
        }
    }

    /// Whether the request fits into the remaining headroom right now.
    pub fn can_admit(&self, request: &Resources) -> bool {
        request.cores <= self.capacity.cores - self.in_use.cores
            && request.memory <= self.capacity.memory - self.in_use.memory
            && request.disk <= self.capacity.disk - self.in_use.disk
    }

    pub fn acquire(&mut self, request: &Resources) {
        debug_assert!(self.can_admit(request));
        self.in_use.cores += request.cores;
        self.in_use.memory += request.memory;
        self.in_use.disk += request.disk;
    }

    pub fn release(&mut self, request: &Resources) {
        self.in_use.cores = self.in_use.cores.saturating_sub(request.cores);
        self.in_use.memory = self.in_use.memory.saturating_sub(request.memory);
        self.in_use.disk = self.in_use.disk.saturating_sub(request.disk);
    }
}

/// Capacity of the local worker, derived from the host by default.
pub fn default_capacity() -> Resources {
    let cores = num_cpus::get() as u32;
    Resources::new(cores, 2 * (1u64 << 30) * cores as u64, u64::MAX)
}
