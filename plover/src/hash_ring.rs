use foldhash::fast::RandomState;
use std::collections::HashMap;

/// Consistent hash ring mapping arbitrary keys to server keys.
///
/// Each server owns `replicas` points on a `u32` ring; a key belongs to the
/// server of the first point at or after its own hash, wrapping around.
#[derive(Debug, Clone)]
pub struct HashRing {
    replicas: usize,
    points: Vec<u32>,
    servers: HashMap<u32, String, RandomState>,
}

impl HashRing {
    #[must_use]
    pub fn new(replicas: usize) -> Self {
        Self {
            replicas: replicas.max(1),
            points: Vec::new(),
            servers: HashMap::default(),
        }
    }

    pub fn add(&mut self, server: &str) {
        for i in 0..self.replicas {
            let point = Self::hash(format!("{i}{server}").as_bytes());
            self.points.push(point);
            self.servers.insert(point, server.to_string());
        }
        self.points.sort_unstable();
        self.points.dedup();
    }

    #[must_use]
    pub fn get(&self, key: impl AsRef<[u8]>) -> Option<&str> {
        if self.points.is_empty() {
            return None;
        }
        let hash = Self::hash(key.as_ref());
        let idx = self.points.partition_point(|&p| p < hash) % self.points.len();
        self.servers.get(&self.points[idx]).map(String::as_str)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.points.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    fn hash(key: &[u8]) -> u32 {
        crc32c::crc32c(key)
    }
}
