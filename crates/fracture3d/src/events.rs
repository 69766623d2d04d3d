//! Collision and breaking events delivered to registered handlers.

use crate::particle::ParticleId;
use glam::Vec3;
use serde::{Deserialize, Serialize};

/// Thresholds an event must reach before delivery. Disabled filters pass everything.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventFilter {
    pub enabled: bool,
    pub min_mass: f32,
    pub min_speed: f32,
    pub min_impulse: f32,
    pub min_volume: f32,
}

impl EventFilter {
    pub fn accepts(&self, mass: f32, speed: f32, impulse: f32, volume: f32) -> bool {
        !self.enabled
            || (mass >= self.min_mass
                && speed >= self.min_speed
                && impulse >= self.min_impulse
                && volume >= self.min_volume)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CollisionEvent {
    pub frame: u64,
    pub particle: ParticleId,
    /// `None` for contacts with the ground plane
    pub other: Option<ParticleId>,
    #[serde(with = "crate::serde_utils::vec3")]
    pub position: Vec3,
    #[serde(with = "crate::serde_utils::vec3")]
    pub normal: Vec3,
    pub impulse: f32,
    pub mass: f32,
    #[serde(with = "crate::serde_utils::vec3")]
    pub velocity: Vec3,
    pub volume: f32,
}

/// A piece that became free when its cluster broke.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BreakingEvent {
    pub frame: u64,
    pub particle: ParticleId,
    pub parent: ParticleId,
    #[serde(with = "crate::serde_utils::vec3")]
    pub position: Vec3,
    #[serde(with = "crate::serde_utils::vec3")]
    pub velocity: Vec3,
    #[serde(with = "crate::serde_utils::vec3")]
    pub angular_velocity: Vec3,
    pub mass: f32,
    pub volume: f32,
}

pub type CollisionHandler = Box<dyn FnMut(&[CollisionEvent]) + Send>;
pub type BreakingHandler = Box<dyn FnMut(&[BreakingEvent]) + Send>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandlerId(u32);

/// Buffers events during a step and hands the filtered batch to every handler.
pub struct EventManager {
    collision_filter: EventFilter,
    breaking_filter: EventFilter,
    collision_handlers: Vec<(HandlerId, CollisionHandler)>,
    breaking_handlers: Vec<(HandlerId, BreakingHandler)>,
    pending_collisions: Vec<CollisionEvent>,
    pending_breaks: Vec<BreakingEvent>,
    last_collisions: Vec<CollisionEvent>,
    last_breaks: Vec<BreakingEvent>,
    next_handler: u32,
}

impl EventManager {
    pub fn new(collision_filter: EventFilter, breaking_filter: EventFilter) -> Self {
        Self {
            collision_filter,
            breaking_filter,
            collision_handlers: Vec::new(),
            breaking_handlers: Vec::new(),
            pending_collisions: Vec::new(),
            pending_breaks: Vec::new(),
            last_collisions: Vec::new(),
            last_breaks: Vec::new(),
            next_handler: 0,
        }
    }

    fn allocate_handler(&mut self) -> HandlerId {
        let id = HandlerId(self.next_handler);
        self.next_handler += 1;
        id
    }

    pub fn register_collision_handler(&mut self, handler: CollisionHandler) -> HandlerId {
        let id = self.allocate_handler();
        self.collision_handlers.push((id, handler));
        id
    }

    pub fn register_breaking_handler(&mut self, handler: BreakingHandler) -> HandlerId {
        let id = self.allocate_handler();
        self.breaking_handlers.push((id, handler));
        id
    }

    pub fn unregister(&mut self, id: HandlerId) -> bool {
        let before = self.collision_handlers.len() + self.breaking_handlers.len();
        self.collision_handlers.retain(|(h, _)| *h != id);
        self.breaking_handlers.retain(|(h, _)| *h != id);
        before != self.collision_handlers.len() + self.breaking_handlers.len()
    }

    pub fn set_collision_filter(&mut self, filter: EventFilter) {
        self.collision_filter = filter;
    }

    pub fn set_breaking_filter(&mut self, filter: EventFilter) {
        self.breaking_filter = filter;
    }

    pub fn push_collision(&mut self, event: CollisionEvent) {
        self.pending_collisions.push(event);
    }

    pub fn push_breaking(&mut self, event: BreakingEvent) {
        self.pending_breaks.push(event);
    }

    /// Filters the buffered events and delivers them. With `deliver == false`
    /// the batch is still filtered and kept but no handler runs.
    pub fn dispatch(&mut self, deliver: bool) {
        let collision_filter = &self.collision_filter;
        self.last_collisions = self
            .pending_collisions
            .drain(..)
            .filter(|e| collision_filter.accepts(e.mass, e.velocity.length(), e.impulse, e.volume))
            .collect();

        let breaking_filter = &self.breaking_filter;
        self.last_breaks = self
            .pending_breaks
            .drain(..)
            .filter(|e| breaking_filter.accepts(e.mass, e.velocity.length(), 0.0, e.volume))
            .collect();

        if !deliver {
            return;
        }
        if !self.last_collisions.is_empty() {
            for (_, handler) in &mut self.collision_handlers {
                handler(&self.last_collisions);
            }
        }
        if !self.last_breaks.is_empty() {
            for (_, handler) in &mut self.breaking_handlers {
                handler(&self.last_breaks);
            }
        }
    }

    /// Collision events that passed the filter in the last step.
    pub fn last_collisions(&self) -> &[CollisionEvent] {
        &self.last_collisions
    }

    pub fn last_breaks(&self) -> &[BreakingEvent] {
        &self.last_breaks
    }
}

impl std::fmt::Debug for EventManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventManager")
            .field("collision_handlers", &self.collision_handlers.len())
            .field("breaking_handlers", &self.breaking_handlers.len())
            .field("collision_filter", &self.collision_filter)
            .field("breaking_filter", &self.breaking_filter)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn breaking(mass: f32) -> BreakingEvent {
        BreakingEvent {
            frame: 0,
            particle: ParticleId(1),
            parent: ParticleId(0),
            position: Vec3::ZERO,
            velocity: Vec3::X,
            angular_velocity: Vec3::ZERO,
            mass,
            volume: 1.0,
        }
    }

    #[test]
    fn test_disabled_filter_accepts_everything() {
        assert!(EventFilter::default().accepts(0.0, 0.0, 0.0, 0.0));
    }

    #[test]
    fn test_filter_rejects_light_pieces() {
        let mut events = EventManager::new(
            EventFilter::default(),
            EventFilter {
                enabled: true,
                min_mass: 2.0,
                ..EventFilter::default()
            },
        );
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        events.register_breaking_handler(Box::new(move |batch| {
            sink.lock().unwrap().extend(batch.iter().map(|e| e.mass));
        }));

        events.push_breaking(breaking(1.0));
        events.push_breaking(breaking(3.0));
        events.dispatch(true);
        assert_eq!(*seen.lock().unwrap(), vec![3.0]);
        assert_eq!(events.last_breaks().len(), 1);
    }

    #[test]
    fn test_suppressed_dispatch_skips_handlers() {
        let mut events = EventManager::new(EventFilter::default(), EventFilter::default());
        let calls = Arc::new(Mutex::new(0));
        let counter = calls.clone();
        let id = events.register_breaking_handler(Box::new(move |_| *counter.lock().unwrap() += 1));

        events.push_breaking(breaking(1.0));
        events.dispatch(false);
        assert_eq!(*calls.lock().unwrap(), 0);
        assert_eq!(events.last_breaks().len(), 1);

        assert!(events.unregister(id));
        events.push_breaking(breaking(1.0));
        events.dispatch(true);
        assert_eq!(*calls.lock().unwrap(), 0);
    }
}
