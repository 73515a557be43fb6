use crate::orchestrator::{ClipmapPlugin, CollisionTilePlugin, ReadbackPlugin, SpawnablePlugin};
use bevy::app::{App, Plugin};

mod budget;
mod clipmap;
mod collision;
mod components;
mod generator;
mod orchestrator;
pub mod prelude;
mod readback;
mod ring_cache;
mod scheduler;
mod settings;
mod spawnable;
mod texture_cache;

pub struct BevyClipmapTerrainPlugins;

impl Plugin for BevyClipmapTerrainPlugins {
    fn build(&self, app: &mut App) {
        app.add_plugins(ReadbackPlugin)
            .add_plugins(ClipmapPlugin)
            .add_plugins(CollisionTilePlugin)
            .add_plugins(SpawnablePlugin);
    }
}
