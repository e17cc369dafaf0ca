use crate::error::{ImgflowError, Result};

/// One assignable processing node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeEndpoint {
    pub address: String,
    pub port: u16,
}

impl std::fmt::Display for NodeEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.address, self.port)
    }
}

/// Registered nodes plus the round-robin cursor.
///
/// Insertion order is significant: assignments cycle through the list in
/// registration order. The whole struct lives behind a single lock, so the
/// length read and cursor advance in [`NodeRegistry::next`] are one atomic
/// step — the cursor advances exactly once per call regardless of
/// concurrent callers.
#[derive(Debug, Default)]
pub struct NodeRegistry {
    nodes: Vec<NodeEndpoint>,
    cursor: usize,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a node unconditionally. Duplicates are permitted.
    pub fn register(&mut self, node: NodeEndpoint) {
        tracing::info!(node = %node, "Node registered");
        self.nodes.push(node);
    }

    /// Next node in round-robin order.
    pub fn next(&mut self) -> Result<NodeEndpoint> {
        if self.nodes.is_empty() {
            return Err(ImgflowError::NoNodesAvailable);
        }
        let index = self.cursor % self.nodes.len();
        self.cursor = self.cursor.wrapping_add(1);
        Ok(self.nodes[index].clone())
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn nodes(&self) -> &[NodeEndpoint] {
        &self.nodes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint(port: u16) -> NodeEndpoint {
        NodeEndpoint {
            address: "127.0.0.1".to_string(),
            port,
        }
    }

    #[test]
    fn empty_registry_fails_assignment() {
        let mut registry = NodeRegistry::new();
        assert!(matches!(
            registry.next(),
            Err(ImgflowError::NoNodesAvailable)
        ));
    }

    #[test]
    fn assignments_cycle_in_insertion_order() {
        let mut registry = NodeRegistry::new();
        registry.register(endpoint(1));
        registry.register(endpoint(2));
        registry.register(endpoint(3));

        let ports: Vec<u16> = (0..7).map(|_| registry.next().unwrap().port).collect();
        assert_eq!(ports, vec![1, 2, 3, 1, 2, 3, 1]);
    }

    #[test]
    fn registration_mid_cycle_extends_the_ring() {
        let mut registry = NodeRegistry::new();
        registry.register(endpoint(1));
        registry.register(endpoint(2));

        assert_eq!(registry.next().unwrap().port, 1);
        assert_eq!(registry.next().unwrap().port, 2);

        registry.register(endpoint(3));
        // cursor is 2, list is now length 3
        assert_eq!(registry.next().unwrap().port, 3);
        assert_eq!(registry.next().unwrap().port, 1);
    }

    #[test]
    fn duplicates_are_permitted() {
        let mut registry = NodeRegistry::new();
        registry.register(endpoint(1));
        registry.register(endpoint(1));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn cursor_wraps_without_panicking() {
        let mut registry = NodeRegistry::new();
        registry.register(endpoint(1));
        registry.cursor = usize::MAX;
        // usize::MAX % 1 == 0, and the increment wraps
        assert_eq!(registry.next().unwrap().port, 1);
        assert_eq!(registry.next().unwrap().port, 1);
    }
}
