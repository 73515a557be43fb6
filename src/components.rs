use bevy::ecs::event::Event;
use bevy::math::IVec2;
use bevy::platform::collections::HashSet;
use bevy::ecs::reflect::{ReflectComponent, ReflectResource};
use bevy::prelude::{Component, Resource};
use bevy::reflect::std_traits::ReflectDefault;
use bevy::reflect::Reflect;

/// 地形跟随的主视点 (通常是主相机)
/// The main viewpoint the terrain follows (usually the main camera)
#[derive(Component, Reflect, Default, Clone)]
#[reflect(Component)]
pub struct TerrainViewer;

/// 碰撞瓦片池额外跟踪的次级视点 (载具, 远程角色, ...)
/// Secondary viewpoints the collision pool also tracks (vehicles, remote
/// characters, ...)
#[derive(Component, Reflect, Default, Clone)]
#[reflect(Component)]
pub struct TrackedViewpoint;

/// 地形锚点实体的标记; 其 Transform 决定地形原点与海拔基准
/// Marker for the terrain anchor entity; its Transform sets the terrain
/// origin and the altitude baseline
#[derive(Component, Reflect, Default, Clone)]
#[reflect(Component)]
pub struct ClipmapTerrain;

/// 事件: 请求一次完整重建 (结构性修改, 精度安全回退)
/// Event: request a full rebuild (structural edits, precision fallback)
#[derive(Event, Debug, Default, Clone)]
pub struct TerrainRebuildRequested;

/// 缓存各池驻留坐标的集合, 供系统间 O(1) 查询
/// Cached sets of resident coordinates per pool for O(1) cross-system queries
#[derive(Resource, Debug, Clone, Default, Reflect)]
#[reflect(Resource, Default)]
pub struct TerrainStateCache {
    /// 当前驻留的碰撞瓦片坐标集合
    /// Set of currently resident collision tile coordinates
    pub collision_tiles: HashSet<IVec2>,
    /// 当前驻留的可生成物瓦片坐标集合 (跨所有池)
    /// Set of currently resident spawnable tile coordinates (across pools)
    pub spawnable_tiles: HashSet<IVec2>,
}

impl TerrainStateCache {
    /// 每帧重建前清空 / Cleared before the per-tick rebuild
    pub fn clear(&mut self) {
        self.collision_tiles.clear();
        self.spawnable_tiles.clear();
    }
}
