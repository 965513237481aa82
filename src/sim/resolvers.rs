use std::future::Future;

use serde_json::Value;

use super::World;
use crate::executor::MainThreadExecutor;
use crate::resolve::ResolverTable;
use crate::tag::{GlobalKind, KeyedKind};

/// Resolvers for every tag the simulation announces. Each one reads the
/// world through the executor, so it runs between ticks on the simulation
/// thread.
pub fn resolvers(executor: MainThreadExecutor<World>) -> ResolverTable {
    let cars = executor.clone();
    let jobs = executor.clone();
    let junctions = executor.clone();
    let player = executor.clone();
    let car = executor.clone();
    let trainset = executor;

    ResolverTable::new()
        .global(GlobalKind::Cars, move || read(&cars, |w| w.cars_json()))
        .global(GlobalKind::Jobs, move || read(&jobs, |w| w.jobs_json()))
        .global(GlobalKind::Junctions, move || {
            read(&junctions, |w| w.junction_state_json())
        })
        .global(GlobalKind::Player, move || read(&player, |w| w.player_json()))
        // A car removed since the tag was announced resolves to null.
        .keyed(KeyedKind::CarGuid, move |guid| {
            read(&car, move |w| w.car_json(&guid).unwrap_or(Value::Null))
        })
        .keyed(KeyedKind::Trainset, move |id| {
            let id = id.parse::<u32>().ok();
            read(&trainset, move |w| match id {
                Some(id) => w.trainset_json(id),
                None => Value::Object(Default::default()),
            })
        })
}

fn read<F>(
    executor: &MainThreadExecutor<World>,
    f: F,
) -> impl Future<Output = anyhow::Result<Value>> + Send + 'static
where
    F: FnOnce(&mut World) -> Value + Send + 'static,
{
    let result = executor.submit(move |w: &mut World| f(w));
    async move { Ok(result.await?) }
}
