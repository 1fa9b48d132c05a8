//! Driver-side destination registry for multi-destination publications
//!
//! Each destination is one independently managed fan-out target. A
//! destination carries its own replicate positions (one per linked image),
//! so adding or removing one never disturbs another's in-flight state.

use std::collections::HashMap;

/// One fan-out target of a publication
#[derive(Debug)]
pub struct Destination {
    registration_id: i64,
    channel: String,
    endpoint: String,
    manual: bool,
    /// Image id -> replicate position for frames this destination ships
    links: HashMap<i64, i64>,
}

impl Destination {
    /// Create a destination; `manual` is false for implicit/dynamic ones
    pub fn new(registration_id: i64, channel: String, endpoint: String, manual: bool) -> Self {
        Self {
            registration_id,
            channel,
            endpoint,
            manual,
            links: HashMap::new(),
        }
    }

    /// Correlation id of the add operation, used for removal
    pub fn registration_id(&self) -> i64 {
        self.registration_id
    }

    /// Channel the destination was added with
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Endpoint key subscriptions match on
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Whether the application added this destination explicitly
    pub fn is_manual(&self) -> bool {
        self.manual
    }

    /// Attach an image, shipping from `position` onwards
    pub fn link_image(&mut self, image_id: i64, position: i64) {
        self.links.entry(image_id).or_insert(position);
    }

    /// Detach an image link
    pub fn unlink_image(&mut self, image_id: i64) {
        self.links.remove(&image_id);
    }

    /// Whether this destination ships to the given image
    pub fn is_linked(&self, image_id: i64) -> bool {
        self.links.contains_key(&image_id)
    }

    /// Mutable view of (image id, replicate position) pairs
    pub fn links_mut(&mut self) -> impl Iterator<Item = (&i64, &mut i64)> {
        self.links.iter_mut()
    }

    /// Image ids this destination ships to
    pub fn linked_images(&self) -> impl Iterator<Item = i64> + '_ {
        self.links.keys().copied()
    }
}

/// The per-publication set of destinations
#[derive(Debug, Default)]
pub struct DestinationRegistry {
    destinations: Vec<Destination>,
}

impl DestinationRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a destination
    pub fn add(&mut self, destination: Destination) {
        self.destinations.push(destination);
    }

    /// Deregister by the registration id of the add; the removed
    /// destination's links die with it, other destinations are untouched
    pub fn remove_by_id(&mut self, registration_id: i64) -> Option<Destination> {
        let index = self
            .destinations
            .iter()
            .position(|d| d.registration_id() == registration_id)?;
        Some(self.destinations.remove(index))
    }

    /// Whether any destination targets the endpoint
    pub fn has_endpoint(&self, endpoint: &str) -> bool {
        self.destinations.iter().any(|d| d.endpoint() == endpoint)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Destination> {
        self.destinations.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Destination> {
        self.destinations.iter_mut()
    }

    pub fn len(&self) -> usize {
        self.destinations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.destinations.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn destination(id: i64, endpoint: &str) -> Destination {
        Destination::new(
            id,
            format!("bus:mem?endpoint={}", endpoint),
            endpoint.to_string(),
            true,
        )
    }

    #[test]
    fn test_add_and_remove_by_id() {
        let mut registry = DestinationRegistry::new();
        registry.add(destination(1, "e1"));
        registry.add(destination(2, "e2"));
        assert_eq!(registry.len(), 2);
        assert!(registry.has_endpoint("e1"));

        let removed = registry.remove_by_id(1).unwrap();
        assert_eq!(removed.endpoint(), "e1");
        assert!(!registry.has_endpoint("e1"));
        assert!(registry.has_endpoint("e2"));

        assert!(registry.remove_by_id(1).is_none());
    }

    #[test]
    fn test_removal_leaves_other_links_untouched() {
        let mut registry = DestinationRegistry::new();
        let mut a = destination(1, "e1");
        let mut b = destination(2, "e2");
        a.link_image(100, 0);
        b.link_image(200, 512);
        registry.add(a);
        registry.add(b);

        registry.remove_by_id(1);
        let survivor = registry.iter().next().unwrap();
        assert!(survivor.is_linked(200));
        assert_eq!(survivor.registration_id(), 2);
    }

    #[test]
    fn test_link_is_idempotent_on_position() {
        let mut dest = destination(1, "e1");
        dest.link_image(100, 64);
        // relinking must not rewind the replicate position
        dest.link_image(100, 0);
        let positions: Vec<i64> = dest.links_mut().map(|(_, p)| *p).collect();
        assert_eq!(positions, vec![64]);
    }
}
