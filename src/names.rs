use std::collections::HashSet;

use uuid::Uuid;

/// Short agent names used as the final segment of session identifiers.
const NAME_POOL: &[&str] = &[
    "sam", "mia", "leo", "zoe", "max", "ivy", "kai", "ada", "ben", "eve", "gus", "lia", "ned",
    "ona", "pax", "rae", "sid", "tess", "uma", "vic", "wyn", "ximo", "yara", "zed", "finn", "lola",
    "otto", "ruby", "theo", "nova",
];

/// Pick a random agent name not already in use. Falls back to numbered names
/// once the pool is exhausted.
pub fn pick_agent_name(in_use: &HashSet<String>) -> String {
    let seed = Uuid::new_v4();
    let offset = usize::from(u16::from_le_bytes([seed.as_bytes()[0], seed.as_bytes()[1]]));
    for i in 0..NAME_POOL.len() {
        let candidate = NAME_POOL[(offset + i) % NAME_POOL.len()];
        if !in_use.contains(candidate) {
            return candidate.to_string();
        }
    }
    let mut n = 1;
    loop {
        let candidate = format!("agent{n}");
        if !in_use.contains(&candidate) {
            return candidate;
        }
        n += 1;
    }
}

/// Short random hex segment distinguishing sessions spawned with the same
/// agent name over time.
pub fn session_hash() -> String {
    Uuid::new_v4().simple().to_string()[..6].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn picks_from_pool_when_names_are_free() {
        let picked = pick_agent_name(&HashSet::new());
        assert!(NAME_POOL.contains(&picked.as_str()));
    }

    #[test]
    fn avoids_names_in_use() {
        let in_use: HashSet<String> = NAME_POOL
            .iter()
            .take(NAME_POOL.len() - 1)
            .map(|s| s.to_string())
            .collect();
        let picked = pick_agent_name(&in_use);
        assert!(!in_use.contains(&picked));
    }

    #[test]
    fn falls_back_to_numbered_names() {
        let mut in_use: HashSet<String> = NAME_POOL.iter().map(|s| s.to_string()).collect();
        let first = pick_agent_name(&in_use);
        assert_eq!(first, "agent1");
        in_use.insert(first);
        assert_eq!(pick_agent_name(&in_use), "agent2");
    }

    #[test]
    fn session_hash_is_six_hex_chars() {
        let hash = session_hash();
        assert_eq!(hash.len(), 6);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
