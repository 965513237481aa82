use std::collections::BTreeMap;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::{json, Map, Value};

use super::model::{Car, Job, Junction, LocoContext, LocoControls, Player, Position, Trainset};
use super::SimError;
use crate::bus::ChangeListener;
use crate::config::SimulationSection;
use crate::tag::{GlobalKind, Tag};

const LOCO_LENGTH_M: f64 = 14.0;
const WAGON_LENGTH_M: f64 = 12.0;
const WAGON_MASS_T: f64 = 25.0;
/// Centre-to-centre distance within which two trainsets can couple.
const COUPLING_RANGE_M: f64 = 20.0;
const TRACTION_ACCEL: f64 = 0.6;
const BRAKE_DECEL: f64 = 1.2;
const ROLLING_DECEL: f64 = 0.02;
const MAX_SPEED: f64 = 33.0;

/// Spacing of the points in a rendered track polyline.
const TRACK_RESOLUTION_M: f64 = 40.0;
const BRANCH_LENGTH_M: f64 = 200.0;
/// Angle between the two branches leaving a junction.
const BRANCH_SPREAD_DEG: f64 = 12.0;
/// Length of straight mainline laid ahead of and behind each spawned trainset.
const MAINLINE_REACH_M: f64 = 2_000.0;

const YARDS: &[&str] = &["HB", "SM", "FF", "GF", "MF", "CSW", "IME", "OWN", "FM", "SW"];

/// One remote-control lever or action, parsed from a `key=value` pair.
#[derive(Debug, Clone, Copy, PartialEq)]
enum LocoCommand {
    Throttle(f64),
    TrainBrake(f64),
    IndependentBrake(f64),
    Reverser(f64),
    Horn(f64),
    Sander(f64),
    Couple,
    Uncouple(i64),
}

impl LocoCommand {
    fn parse(key: &str, value: &str) -> Option<Self> {
        let raw: f64 = value.trim().parse().ok()?;
        if !raw.is_finite() {
            return None;
        }
        let v = raw.clamp(0.0, 1.0);
        Some(match key {
            "throttle" => LocoCommand::Throttle(v),
            "trainBrake" => LocoCommand::TrainBrake(v),
            "independentBrake" => LocoCommand::IndependentBrake(v),
            "reverser" => LocoCommand::Reverser(v),
            "horn" => LocoCommand::Horn(v),
            "sander" => LocoCommand::Sander(v),
            "couple" => LocoCommand::Couple,
            "uncouple" => LocoCommand::Uncouple(raw as i64),
            _ => return None,
        })
    }
}

/// The demo simulation state, owned by the simulation thread.
///
/// Every mutation that changes what a client would see reports the matching
/// tag to the registered change listeners.
#[derive(Default)]
pub struct World {
    cars: BTreeMap<String, Car>,
    trainsets: BTreeMap<u32, Trainset>,
    junctions: Vec<Junction>,
    tracks: BTreeMap<String, Vec<Position>>,
    jobs: BTreeMap<String, Job>,
    player: Player,
    /// Car the player stands on; the player follows it as it moves.
    riding: Option<String>,
    last_player_report: Option<Value>,
    listeners: Vec<ChangeListener>,
    next_trainset_id: u32,
    next_car_number: u32,
}

impl std::fmt::Debug for World {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("World")
            .field("cars", &self.cars.len())
            .field("trainsets", &self.trainsets.len())
            .field("junctions", &self.junctions.len())
            .field("tracks", &self.tracks.len())
            .field("jobs", &self.jobs.len())
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

impl World {
    pub fn new() -> Self {
        Self {
            next_trainset_id: 1,
            next_car_number: 1,
            ..Default::default()
        }
    }

    /// Build a random world shaped by `cfg`. The same seed gives the same
    /// layout; car guids are always fresh.
    pub fn generate(cfg: &SimulationSection, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut world = World::new();

        for _ in 0..cfg.trainsets {
            let origin = Position::new(rng.gen_range(0.0..16_000.0), rng.gen_range(0.0..16_000.0));
            let heading = rng.gen_range(0.0..360.0);
            let ts = world.spawn_trainset(origin, heading, cfg.cars_per_trainset as usize);
            world.tracks.insert(
                format!("M{ts:02}"),
                polyline(origin.advanced(heading, MAINLINE_REACH_M), heading + 180.0, 2.0 * MAINLINE_REACH_M),
            );

            let wagons: Vec<String> = world.trainsets[&ts]
                .cars
                .iter()
                .filter_map(|g| world.cars.get(g))
                .filter(|c| !c.is_loco())
                .map(|c| c.id.clone())
                .collect();
            if wagons.is_empty() {
                continue;
            }
            let origin_yard = YARDS[rng.gen_range(0..YARDS.len())];
            let mut destination_yard = YARDS[rng.gen_range(0..YARDS.len())];
            while destination_yard == origin_yard {
                destination_yard = YARDS[rng.gen_range(0..YARDS.len())];
            }
            let job = Job {
                id: format!("{}-{}-{:02}", origin_yard, destination_yard, ts),
                origin_yard_id: origin_yard.to_string(),
                destination_yard_id: destination_yard.to_string(),
                start_track: format!("{}-B{}O", origin_yard, rng.gen_range(1..9)),
                destination_track: format!("{}-C{}I", destination_yard, rng.gen_range(1..9)),
                length: wagons.len() as f64 * WAGON_LENGTH_M,
                mass: wagons.len() as f64 * WAGON_MASS_T,
                base_payment: (rng.gen_range(2_000.0..20_000.0_f64)).round(),
                cars: wagons,
                is_active: false,
            };
            world.add_job(job);
        }

        for i in 0..cfg.junctions {
            let yard = YARDS[i as usize % YARDS.len()];
            let position = Position::new(rng.gen_range(0.0..16_000.0), rng.gen_range(0.0..16_000.0));
            let heading: f64 = rng.gen_range(0.0..360.0);
            let branches = vec![format!("{yard}-J{i}L"), format!("{yard}-J{i}R")];
            for (branch, side) in branches.iter().zip([-1.0, 1.0]) {
                let track = polyline(position, heading + side * BRANCH_SPREAD_DEG / 2.0, BRANCH_LENGTH_M);
                world.tracks.insert(branch.clone(), track);
            }
            world.junctions.push(Junction {
                position,
                branches,
                selected_branch: 0,
            });
        }

        world.riding = world.loco_guids().into_iter().next();
        world.follow_ridden_car();
        world
    }

    /// Report future changes to `listener`.
    pub fn register_change_listener(&mut self, listener: ChangeListener) {
        self.listeners.push(listener);
    }

    fn announce(&self, tag: Tag) {
        for listener in &self.listeners {
            listener(tag.clone());
        }
    }

    // ── reads ──────────────────────────────────────────────────────

    pub fn car(&self, guid: &str) -> Option<&Car> {
        self.cars.get(guid)
    }

    pub fn trainset(&self, id: u32) -> Option<&Trainset> {
        self.trainsets.get(&id)
    }

    pub fn trainset_ids(&self) -> Vec<u32> {
        self.trainsets.keys().copied().collect()
    }

    pub fn job(&self, id: &str) -> Option<&Job> {
        self.jobs.get(id)
    }

    pub fn junction_count(&self) -> usize {
        self.junctions.len()
    }

    pub fn player(&self) -> &Player {
        &self.player
    }

    /// Guid of the car the player is riding, if any.
    pub fn riding(&self) -> Option<&str> {
        self.riding.as_deref()
    }

    /// Guids of every locomotive, sorted.
    pub fn loco_guids(&self) -> Vec<String> {
        self.cars
            .values()
            .filter(|c| c.is_loco())
            .map(|c| c.guid.clone())
            .collect()
    }

    fn loco_context(&self, car: &Car) -> Option<LocoContext> {
        car.loco.as_ref()?;
        let ts = self.trainsets.get(&car.trainset)?;
        let index = ts.cars.iter().position(|g| *g == car.guid)?;
        Some(LocoContext {
            can_couple: self.coupling_candidate(ts.id).is_some(),
            cars_in_front: index,
            cars_in_rear: ts.cars.len() - index - 1,
            forward_speed: ts.speed,
        })
    }

    fn render_car(&self, car: &Car) -> Value {
        car.to_json(self.loco_context(car).as_ref())
    }

    /// Every car keyed by its human-facing id.
    pub fn cars_json(&self) -> Value {
        let map: Map<String, Value> = self
            .cars
            .values()
            .map(|c| (c.id.clone(), self.render_car(c)))
            .collect();
        Value::Object(map)
    }

    /// One car with its id included, or `None` if no such car exists.
    pub fn car_json(&self, guid: &str) -> Option<Value> {
        let car = self.cars.get(guid)?;
        let mut value = self.render_car(car);
        if let Value::Object(obj) = &mut value {
            obj.insert("id".into(), Value::String(car.id.clone()));
        }
        Some(value)
    }

    /// Cars of one trainset keyed by id. An unknown trainset renders as `{}`.
    pub fn trainset_json(&self, id: u32) -> Value {
        let map: Map<String, Value> = self
            .trainsets
            .get(&id)
            .into_iter()
            .flat_map(|ts| ts.cars.iter())
            .filter_map(|g| self.cars.get(g))
            .map(|c| (c.id.clone(), self.render_car(c)))
            .collect();
        Value::Object(map)
    }

    pub fn jobs_json(&self) -> Value {
        Value::Object(
            self.jobs
                .iter()
                .map(|(id, job)| (id.clone(), job.to_json()))
                .collect(),
        )
    }

    /// Static junction layout: positions and branch track ids.
    pub fn junctions_json(&self) -> Value {
        Value::Array(self.junctions.iter().map(Junction::to_json).collect())
    }

    /// Selected branch of each junction, in junction order.
    pub fn junction_state_json(&self) -> Value {
        Value::Array(
            self.junctions
                .iter()
                .map(|j| Value::from(j.selected_branch))
                .collect(),
        )
    }

    pub fn player_json(&self) -> Value {
        self.player.to_json()
    }

    /// Every track as a polyline of `[lat, lon]` points, keyed by track id.
    pub fn track_json(&self) -> Value {
        Value::Object(
            self.tracks
                .iter()
                .map(|(id, points)| {
                    let line: Vec<Value> = points.iter().map(|p| json!(p.to_latlon())).collect();
                    (id.clone(), Value::Array(line))
                })
                .collect(),
        )
    }

    // ── mutations ──────────────────────────────────────────────────

    /// Couple a new trainset at `front`, locomotive first, cars trailing
    /// opposite to `heading`. Returns the trainset id.
    pub fn spawn_trainset(&mut self, front: Position, heading: f64, car_count: usize) -> u32 {
        let id = self.next_trainset_id;
        self.next_trainset_id += 1;

        let mut guids = Vec::with_capacity(car_count);
        let mut offset = 0.0;
        for i in 0..car_count {
            let is_loco = i == 0;
            let length = if is_loco { LOCO_LENGTH_M } else { WAGON_LENGTH_M };
            let number = self.next_car_number;
            self.next_car_number += 1;
            let car = Car {
                guid: uuid::Uuid::new_v4().to_string(),
                id: if is_loco {
                    format!("L-{number:03}")
                } else {
                    format!("C-{number:03}")
                },
                length,
                position: front.advanced(heading, -(offset + length / 2.0)),
                rotation: heading,
                trainset: id,
                job_id: None,
                destination_yard_id: None,
                loco: is_loco.then(LocoControls::default),
            };
            offset += length;
            guids.push(car.guid.clone());
            self.cars.insert(car.guid.clone(), car);
        }

        self.trainsets.insert(
            id,
            Trainset {
                id,
                cars: guids,
                speed: 0.0,
                heading,
            },
        );
        tracing::debug!(trainset = id, cars = car_count, "spawned trainset");
        self.announce(GlobalKind::Cars.into());
        id
    }

    /// Delete a car, splitting nothing: the remaining cars of its trainset
    /// stay coupled. An emptied trainset is removed.
    pub fn remove_car(&mut self, guid: &str) -> Result<Car, SimError> {
        let car = self
            .cars
            .remove(guid)
            .ok_or_else(|| SimError::UnknownCar(guid.to_string()))?;

        let mut emptied = false;
        if let Some(ts) = self.trainsets.get_mut(&car.trainset) {
            ts.cars.retain(|g| g != guid);
            emptied = ts.cars.is_empty();
        }
        if emptied {
            self.trainsets.remove(&car.trainset);
        }
        for job in self.jobs.values_mut() {
            job.cars.retain(|id| *id != car.id);
        }
        if self.riding.as_deref() == Some(guid) {
            self.riding = None;
        }

        tracing::debug!(car = %car.id, "removed car");
        self.announce(GlobalKind::Cars.into());
        self.announce(Tag::trainset(car.trainset));
        self.announce(Tag::car(guid));
        Ok(car)
    }

    fn add_job(&mut self, job: Job) {
        for car in self.cars.values_mut() {
            if job.cars.contains(&car.id) {
                car.job_id = Some(job.id.clone());
                car.destination_yard_id = Some(job.destination_yard_id.clone());
            }
        }
        self.jobs.insert(job.id.clone(), job);
    }

    /// Mark a job as taken. Taking an already active job changes nothing.
    pub fn take_job(&mut self, id: &str) -> Result<(), SimError> {
        let job = self
            .jobs
            .get_mut(id)
            .ok_or_else(|| SimError::UnknownJob(id.to_string()))?;
        if !job.is_active {
            job.is_active = true;
            tracing::debug!(job = %id, "job taken");
            self.announce(GlobalKind::Jobs.into());
        }
        Ok(())
    }

    /// Throw a junction to its next branch. Returns the newly selected branch.
    pub fn toggle_junction(&mut self, index: usize) -> Result<usize, SimError> {
        let junction = self
            .junctions
            .get_mut(index)
            .ok_or(SimError::UnknownJunction(index))?;
        let selected = junction.switch();
        tracing::debug!(junction = index, selected, "toggled junction");
        self.announce(GlobalKind::Junctions.into());
        Ok(selected)
    }

    /// Apply remote-control commands to a locomotive.
    ///
    /// Returns `Ok(false)` without touching the locomotive if any key is
    /// unknown or any value is not a number.
    pub fn control_loco<K, V>(&mut self, guid: &str, commands: &[(K, V)]) -> Result<bool, SimError>
    where
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let car = self
            .cars
            .get(guid)
            .ok_or_else(|| SimError::UnknownCar(guid.to_string()))?;
        if !car.is_loco() {
            return Err(SimError::NotALocomotive(guid.to_string()));
        }
        let trainset = car.trainset;

        let parsed: Option<Vec<LocoCommand>> = commands
            .iter()
            .map(|(k, v)| LocoCommand::parse(k.as_ref(), v.as_ref()))
            .collect();
        let Some(parsed) = parsed else {
            tracing::debug!(car = %guid, "rejected loco command");
            return Ok(false);
        };

        for command in parsed {
            if let Some(controls) = self.cars.get_mut(guid).and_then(|c| c.loco.as_mut()) {
                match command {
                    LocoCommand::Throttle(v) => controls.throttle = v,
                    LocoCommand::TrainBrake(v) => {
                        controls.train_brake = v;
                        controls.brake_pipe = 5.0 - 3.5 * v;
                    }
                    LocoCommand::IndependentBrake(v) => controls.independent_brake = v,
                    LocoCommand::Reverser(v) => controls.reverser = v,
                    LocoCommand::Horn(v) => controls.horn = v,
                    LocoCommand::Sander(v) => controls.sander = v,
                    LocoCommand::Couple | LocoCommand::Uncouple(_) => {}
                }
            }
            match command {
                LocoCommand::Couple => self.couple(trainset),
                LocoCommand::Uncouple(n) => self.uncouple(trainset, n),
                _ => {}
            }
        }

        self.announce(Tag::car(guid));
        Ok(true)
    }

    fn coupling_candidate(&self, trainset: u32) -> Option<u32> {
        let ts = self.trainsets.get(&trainset)?;
        let positions: Vec<Position> = ts
            .cars
            .iter()
            .filter_map(|g| self.cars.get(g).map(|c| c.position))
            .collect();
        self.trainsets
            .values()
            .filter(|other| other.id != trainset)
            .find(|other| {
                other
                    .cars
                    .iter()
                    .filter_map(|g| self.cars.get(g))
                    .any(|c| positions.iter().any(|p| p.distance(&c.position) <= COUPLING_RANGE_M))
            })
            .map(|other| other.id)
    }

    /// Merge the nearest trainset in range onto the rear of `trainset`.
    fn couple(&mut self, trainset: u32) {
        let Some(other_id) = self.coupling_candidate(trainset) else {
            return;
        };
        let Some(other) = self.trainsets.remove(&other_id) else {
            return;
        };
        for guid in &other.cars {
            if let Some(car) = self.cars.get_mut(guid) {
                car.trainset = trainset;
            }
        }
        if let Some(ts) = self.trainsets.get_mut(&trainset) {
            ts.cars.extend(other.cars);
            ts.speed = 0.0;
        }
        tracing::debug!(trainset, absorbed = other_id, "coupled trainsets");
        self.announce(GlobalKind::Cars.into());
        self.announce(Tag::trainset(trainset));
        self.announce(Tag::trainset(other_id));
    }

    /// Split `count` cars off the rear (positive) or front (negative) into a
    /// new trainset. At least one car always stays behind.
    fn uncouple(&mut self, trainset: u32, count: i64) {
        let Some(ts) = self.trainsets.get_mut(&trainset) else {
            return;
        };
        let len = ts.cars.len();
        let n = (count.unsigned_abs() as usize).min(len.saturating_sub(1));
        if n == 0 {
            return;
        }
        let detached: Vec<String> = if count > 0 {
            ts.cars.split_off(len - n)
        } else {
            ts.cars.drain(..n).collect()
        };
        let heading = ts.heading;
        ts.speed = 0.0;

        let new_id = self.next_trainset_id;
        self.next_trainset_id += 1;
        for guid in &detached {
            if let Some(car) = self.cars.get_mut(guid) {
                car.trainset = new_id;
            }
        }
        self.trainsets.insert(
            new_id,
            Trainset {
                id: new_id,
                cars: detached,
                speed: 0.0,
                heading,
            },
        );
        tracing::debug!(trainset, new_trainset = new_id, cars = n, "uncoupled");
        self.announce(GlobalKind::Cars.into());
        self.announce(Tag::trainset(trainset));
        self.announce(Tag::trainset(new_id));
    }

    pub fn set_player(&mut self, position: Position, rotation: f64) {
        self.player = Player { position, rotation };
    }

    /// Keep the player on the car it rides.
    fn follow_ridden_car(&mut self) {
        let Some(car) = self.riding.as_ref().and_then(|g| self.cars.get(g)) else {
            return;
        };
        let (position, rotation) = (car.position, car.rotation);
        self.set_player(position, rotation);
    }

    /// Announce the player only when its rendered snapshot differs from the
    /// last one reported.
    fn publish_player(&mut self) {
        let report = self.player.to_json();
        if self.last_player_report.as_ref() != Some(&report) {
            self.last_player_report = Some(report);
            self.announce(GlobalKind::Player.into());
        }
    }

    /// Advance the world by `dt`.
    pub fn tick(&mut self, dt: Duration) {
        let dt = dt.as_secs_f64();
        let ids: Vec<u32> = self.trainsets.keys().copied().collect();
        for id in ids {
            let was_moving = self.trainsets.get(&id).is_some_and(Trainset::is_moving);
            let moving = self.advance_trainset(id, dt);
            // One last announcement when a trainset comes to rest.
            if moving || was_moving {
                self.announce(Tag::trainset(id));
            }
        }
        self.follow_ridden_car();
        self.publish_player();
    }

    fn advance_trainset(&mut self, id: u32, dt: f64) -> bool {
        let Some(ts) = self.trainsets.get(&id) else {
            return false;
        };
        let car_count = ts.cars.len().max(1) as f64;

        let mut traction = 0.0;
        let mut train_brake: f64 = 0.0;
        let mut independent_brake: f64 = 0.0;
        for car in ts.cars.iter().filter_map(|g| self.cars.get(g)) {
            if let Some(loco) = &car.loco {
                traction += loco.throttle * loco.direction() * TRACTION_ACCEL / car_count.sqrt();
                train_brake = train_brake.max(loco.train_brake);
                independent_brake = independent_brake.max(loco.independent_brake);
            }
        }
        let brake = (train_brake + independent_brake * 0.5).min(1.0);

        let mut speed = ts.speed + traction * dt;
        let decel = (brake * BRAKE_DECEL + ROLLING_DECEL) * dt;
        speed = if speed.abs() <= decel {
            0.0
        } else {
            speed - decel * speed.signum()
        };
        speed = speed.clamp(-MAX_SPEED, MAX_SPEED);

        let heading = ts.heading;
        let guids = ts.cars.clone();
        if let Some(ts) = self.trainsets.get_mut(&id) {
            ts.speed = speed;
        }
        if speed == 0.0 {
            return false;
        }

        let step = speed * dt;
        for guid in &guids {
            if let Some(car) = self.cars.get_mut(guid) {
                car.position = car.position.advanced(heading, step);
                if let Some(loco) = car.loco.as_mut() {
                    loco.is_slipping = loco.throttle > 0.9 && loco.sander < 0.1 && speed.abs() < 2.0;
                }
            }
        }
        true
    }
}

/// Points every `TRACK_RESOLUTION_M` along a straight run, both ends included.
fn polyline(start: Position, heading: f64, length: f64) -> Vec<Position> {
    let steps = (length / TRACK_RESOLUTION_M).ceil().max(1.0) as usize;
    (0..=steps)
        .map(|i| start.advanced(heading, (i as f64 * TRACK_RESOLUTION_M).min(length)))
        .collect()
}
