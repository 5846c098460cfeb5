use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{NetworkError, Result};

/// Unordered pair of node names used as an element key.
///
/// `NodePair::new("d", "a") == NodePair::new("a", "d")`, so an element can be
/// found from either traversal direction with one hash lookup.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodePair {
    low: String,
    high: String,
}

impl NodePair {
    pub fn new(a: &str, b: &str) -> Self {
        if a <= b {
            NodePair {
                low: a.to_string(),
                high: b.to_string(),
            }
        } else {
            NodePair {
                low: b.to_string(),
                high: a.to_string(),
            }
        }
    }

    pub fn low(&self) -> &str {
        &self.low
    }

    pub fn high(&self) -> &str {
        &self.high
    }

    pub fn contains(&self, node: &str) -> bool {
        self.low == node || self.high == node
    }
}

impl fmt::Display for NodePair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.low, self.high)
    }
}

/// Split an element name into its two node names.
///
/// Accepts `a-b` with an explicit separator, or a bare two-character name such
/// as `ab` where each character is a node.
pub fn split_element_name(name: &str) -> Result<(String, String)> {
    let name = name.trim();
    if let Some((a, b)) = name.split_once('-') {
        let (a, b) = (a.trim(), b.trim());
        if !a.is_empty() && !b.is_empty() && !b.contains('-') {
            return Ok((a.to_string(), b.to_string()));
        }
    } else {
        let chars: Vec<char> = name.chars().collect();
        if chars.len() == 2 {
            return Ok((chars[0].to_string(), chars[1].to_string()));
        }
    }
    Err(NetworkError::lookup("node pair", name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_pair_is_unordered() {
        assert_eq!(NodePair::new("d", "a"), NodePair::new("a", "d"));
        assert_eq!(NodePair::new("d", "a").to_string(), "a-d");

        let mut map = HashMap::new();
        map.insert(NodePair::new("c", "b"), 1);
        assert_eq!(map.get(&NodePair::new("b", "c")), Some(&1));
    }

    #[test]
    fn test_split_element_name() {
        assert_eq!(split_element_name("ad").unwrap(), ("a".to_string(), "d".to_string()));
        assert_eq!(split_element_name("d-e").unwrap(), ("d".to_string(), "e".to_string()));
        assert_eq!(
            split_element_name("in-out").unwrap(),
            ("in".to_string(), "out".to_string())
        );
        assert!(split_element_name("abc").is_err());
        assert!(split_element_name("a-").is_err());
    }
}
