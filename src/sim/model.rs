//! Plain data for the demo world and its JSON renderings.

use serde::Serialize;
use serde_json::{json, Map, Value};

const EARTH_CIRCUMFERENCE_M: f64 = 40e6;
const DEGREES_PER_METER: f64 = 360.0 / EARTH_CIRCUMFERENCE_M;
const LATLON_DECIMALS: i32 = 8;

/// Ground-plane position in metres. `z` runs north, `x` runs east.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Position {
    pub x: f64,
    pub z: f64,
}

impl Position {
    pub fn new(x: f64, z: f64) -> Self {
        Self { x, z }
    }

    pub fn distance(&self, other: &Position) -> f64 {
        ((self.x - other.x).powi(2) + (self.z - other.z).powi(2)).sqrt()
    }

    /// Step `metres` along a compass heading given in degrees.
    pub fn advanced(&self, heading_deg: f64, metres: f64) -> Position {
        let rad = heading_deg.to_radians();
        Position {
            x: self.x + rad.sin() * metres,
            z: self.z + rad.cos() * metres,
        }
    }

    pub fn to_latlon(self) -> LatLon {
        LatLon::from(self)
    }
}

/// Map coordinates, serialized as `[lat, lon]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LatLon {
    pub latitude: f64,
    pub longitude: f64,
}

impl From<Position> for LatLon {
    fn from(p: Position) -> Self {
        LatLon {
            latitude: round_to(DEGREES_PER_METER * p.z, LATLON_DECIMALS),
            longitude: round_to(DEGREES_PER_METER * p.x, LATLON_DECIMALS),
        }
    }
}

impl Serialize for LatLon {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        [self.latitude, self.longitude].serialize(serializer)
    }
}

pub(crate) fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}

/// Remote-control state of a locomotive. All levers are in `[0, 1]`;
/// a reverser of 0.5 is neutral.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LocoControls {
    pub throttle: f64,
    pub train_brake: f64,
    pub independent_brake: f64,
    pub reverser: f64,
    pub horn: f64,
    pub sander: f64,
    pub brake_pipe: f64,
    pub is_slipping: bool,
}

impl Default for LocoControls {
    fn default() -> Self {
        Self {
            throttle: 0.0,
            train_brake: 0.0,
            independent_brake: 1.0,
            reverser: 0.5,
            horn: 0.0,
            sander: 0.0,
            brake_pipe: 5.0,
            is_slipping: false,
        }
    }
}

impl LocoControls {
    /// -1 for reverse, 1 for forward, 0 in the neutral band.
    pub fn direction(&self) -> f64 {
        if self.reverser > 0.55 {
            1.0
        } else if self.reverser < 0.45 {
            -1.0
        } else {
            0.0
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Car {
    pub guid: String,
    /// Human-facing id such as `L-001`.
    pub id: String,
    pub length: f64,
    pub position: Position,
    pub rotation: f64,
    pub trainset: u32,
    pub job_id: Option<String>,
    pub destination_yard_id: Option<String>,
    pub loco: Option<LocoControls>,
}

/// Coupling context for a locomotive, computed from its trainset.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocoContext {
    pub can_couple: bool,
    pub cars_in_front: usize,
    pub cars_in_rear: usize,
    /// Metres per second; negative when reversing.
    pub forward_speed: f64,
}

impl Car {
    pub fn is_loco(&self) -> bool {
        self.loco.is_some()
    }

    pub fn to_json(&self, ctx: Option<&LocoContext>) -> Value {
        let mut obj = Map::new();
        obj.insert("guid".into(), json!(self.guid));
        obj.insert("length".into(), json!(self.length as i64));
        obj.insert("position".into(), json!(self.position.to_latlon()));
        obj.insert("rotation".into(), json!(round_to(self.rotation, 2)));
        if let Some(job) = &self.job_id {
            obj.insert("jobId".into(), json!(job));
        }
        if let Some(yard) = &self.destination_yard_id {
            obj.insert("destinationYardId".into(), json!(yard));
        }
        if let (Some(loco), Some(ctx)) = (&self.loco, ctx) {
            obj.insert("canBeControlled".into(), json!(true));
            obj.insert("canCouple".into(), json!(ctx.can_couple));
            obj.insert("isSlipping".into(), json!(loco.is_slipping));
            obj.insert("carsInFront".into(), json!(ctx.cars_in_front));
            obj.insert("carsInRear".into(), json!(ctx.cars_in_rear));
            obj.insert("forwardSpeed".into(), json!(ctx.forward_speed * 3.6));
            obj.insert("reverser".into(), json!(loco.reverser));
            obj.insert("independentBrake".into(), json!(loco.independent_brake));
            obj.insert("trainBrake".into(), json!(loco.train_brake));
            obj.insert("throttle".into(), json!(loco.throttle));
            obj.insert("brakePipe".into(), json!(loco.brake_pipe));
        }
        Value::Object(obj)
    }
}

/// Cars coupled together, front to rear.
#[derive(Debug, Clone, PartialEq)]
pub struct Trainset {
    pub id: u32,
    pub cars: Vec<String>,
    /// Metres per second along `heading`; negative when reversing.
    pub speed: f64,
    pub heading: f64,
}

impl Trainset {
    pub fn is_moving(&self) -> bool {
        self.speed.abs() > f64::EPSILON
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Junction {
    pub position: Position,
    pub branches: Vec<String>,
    pub selected_branch: usize,
}

impl Junction {
    /// Advance to the next branch, wrapping around.
    pub fn switch(&mut self) -> usize {
        if !self.branches.is_empty() {
            self.selected_branch = (self.selected_branch + 1) % self.branches.len();
        }
        self.selected_branch
    }

    pub fn to_json(&self) -> Value {
        json!({
            "position": self.position.to_latlon(),
            "branches": self.branches,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    pub id: String,
    pub origin_yard_id: String,
    pub destination_yard_id: String,
    pub start_track: String,
    pub destination_track: String,
    /// Human-facing car ids.
    pub cars: Vec<String>,
    pub length: f64,
    /// Tonnes.
    pub mass: f64,
    pub base_payment: f64,
    pub is_active: bool,
}

impl Job {
    pub fn to_json(&self) -> Value {
        json!({
            "originYardId": self.origin_yard_id,
            "destinationYardId": self.destination_yard_id,
            "tasks": [{
                "startTrack": self.start_track,
                "destinationTrack": self.destination_track,
                "cars": self.cars,
            }],
            "length": self.length,
            "mass": self.mass,
            "basePayment": self.base_payment,
            "isActive": self.is_active,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Player {
    pub position: Position,
    pub rotation: f64,
}

impl Player {
    pub fn to_json(&self) -> Value {
        json!({
            "type": "playerUpdate",
            "position": self.position.to_latlon(),
            "rotation": round_to(self.rotation, 2),
        })
    }
}
