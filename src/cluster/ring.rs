use super::Member;

/// FNV-1a, 64-bit. Deterministic across platforms and processes — every node
/// must place every other node at identical ring positions.
pub fn fnv1a64(data: &[u8]) -> u64 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;
    let mut hash = OFFSET;
    for &b in data {
        hash ^= b as u64;
        hash = hash.wrapping_mul(PRIME);
    }
    hash
}

/// Consistent-hash ring over the alive member set.
///
/// Each member occupies `vnodes` virtual positions placed by hashing
/// `"{node_id}:{i}"`. The primary owner of a key is the first position
/// clockwise from the key's hash. Rings are immutable; membership changes
/// build a new ring published via pointer swap, so in-flight calls keep
/// their snapshot.
pub struct HashRing {
    /// Sorted `(position, member index)` pairs; lookup is a binary search.
    points: Vec<(u64, u32)>,
    members: Vec<Member>,
}

impl HashRing {
    pub fn empty() -> Self {
        Self {
            points: Vec::new(),
            members: Vec::new(),
        }
    }

    pub fn build(mut members: Vec<Member>, vnodes: usize) -> Self {
        // Sort by node id so the ring is identical regardless of the order
        // the membership layer handed the set over in.
        members.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        members.dedup_by(|a, b| a.node_id == b.node_id);

        let mut points = Vec::with_capacity(members.len() * vnodes);
        for (idx, member) in members.iter().enumerate() {
            for i in 0..vnodes {
                let position = fnv1a64(format!("{}:{}", member.node_id, i).as_bytes());
                points.push((position, idx as u32));
            }
        }
        points.sort_unstable();

        Self { points, members }
    }

    /// The member owning `key`, or `None` on an empty ring.
    pub fn owner(&self, key: &str) -> Option<&Member> {
        if self.points.is_empty() {
            return None;
        }
        let hash = fnv1a64(key.as_bytes());
        let idx = match self.points.binary_search_by(|(pos, _)| pos.cmp(&hash)) {
            Ok(i) => i,
            Err(i) if i == self.points.len() => 0, // wrap around
            Err(i) => i,
        };
        Some(&self.members[self.points[idx].1 as usize])
    }

    pub fn members(&self) -> &[Member] {
        &self.members
    }

    pub fn contains(&self, node_id: &str) -> bool {
        self.members.iter().any(|m| m.node_id == node_id)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}
