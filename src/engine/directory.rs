use std::collections::BTreeSet;
use std::sync::Arc;

use tokio::sync::RwLock;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::{Engine, EngineError, EntityKind, snapshot_arcs};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewRoom {
    pub name: String,
    pub building: String,
    pub floor: i32,
    pub capacity: u32,
    pub equipment: BTreeSet<Equipment>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoomFilter {
    pub building: Option<String>,
    pub min_capacity: Option<u32>,
    pub equipment: BTreeSet<Equipment>,
}

impl RoomFilter {
    fn matches(&self, room: &Room) -> bool {
        self.building
            .as_deref()
            .is_none_or(|b| room.building.eq_ignore_ascii_case(b.trim()))
            && self.min_capacity.is_none_or(|c| room.capacity >= c)
            && room.supports(&self.equipment)
    }
}

impl Engine {
    pub async fn register_room(&self, actor: &Identity, new: NewRoom) -> Result<Room, EngineError> {
        if !actor.is_reviewer() {
            return Err(EngineError::Forbidden(format!(
                "{} may not register rooms",
                actor.role
            )));
        }
        let name = new.name.trim().to_string();
        if name.is_empty() || new.building.trim().is_empty() {
            return Err(EngineError::validation("room name and building are required"));
        }
        if name.len() > MAX_NAME_LEN || new.building.len() > MAX_NAME_LEN {
            return Err(EngineError::LimitExceeded("room name too long"));
        }
        if new.capacity == 0 {
            return Err(EngineError::validation("room capacity must be positive"));
        }

        // Exclusive: the occupancy scan below must not race a placement.
        let _exclusive = self.gate.write().await;
        if self.rooms.len() >= MAX_ROOMS_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many rooms"));
        }
        if self.rooms.contains_key(&name) {
            return Err(EngineError::validation(format!("room {name} already registered")));
        }

        let room = Room {
            id: Ulid::new(),
            name: name.clone(),
            building: new.building.trim().to_string(),
            floor: new.floor,
            capacity: new.capacity,
            equipment: new.equipment,
        };
        self.persist(Event::RoomRegistered { room: room.clone() }).await?;

        let mut rs = RoomState::new(room.clone());
        for shared in snapshot_arcs(&self.tutors) {
            let ts = shared.read().await;
            for session in ts.sessions.iter().filter(|s| s.occupied_room() == Some(name.as_str())) {
                rs.insert_occupancy(Occupancy {
                    session_id: session.id,
                    span: session.span,
                });
            }
        }
        tracing::info!("registered room {name} ({} seats, {} existing bookings)", room.capacity, rs.occupancy.len());
        self.rooms.insert(name, Arc::new(RwLock::new(rs)));
        Ok(room)
    }

    pub async fn get_room(&self, name: &str) -> Result<Room, EngineError> {
        let shared = self
            .room(name)
            .ok_or_else(|| EngineError::not_found(EntityKind::Room, name.trim()))?;
        let rs = shared.read().await;
        Ok(rs.room.clone())
    }

    /// Directory query, ordered by building, floor, name.
    pub async fn find_rooms(&self, filter: &RoomFilter) -> Vec<Room> {
        let mut rooms = Vec::new();
        for shared in snapshot_arcs(&self.rooms) {
            let rs = shared.read().await;
            if filter.matches(&rs.room) {
                rooms.push(rs.room.clone());
            }
        }
        rooms.sort_by(|a, b| {
            (a.building.as_str(), a.floor, a.name.as_str()).cmp(&(b.building.as_str(), b.floor, b.name.as_str()))
        });
        rooms
    }

    /// Sessions placed in `name` overlapping `window`.
    pub async fn room_occupancy(&self, name: &str, window: &Span) -> Result<Vec<Occupancy>, EngineError> {
        let shared = self
            .room(name)
            .ok_or_else(|| EngineError::not_found(EntityKind::Room, name.trim()))?;
        let rs = shared.read().await;
        Ok(rs.overlapping(window).copied().collect())
    }
}
