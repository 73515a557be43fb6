use crate::clipmap::{ClipmapLevelSet, DataLayerDesc};
use crate::collision::CollisionTilePool;
use crate::components::{
    ClipmapTerrain, TerrainRebuildRequested, TerrainStateCache, TerrainViewer, TrackedViewpoint,
};
use crate::generator::{BrushRedrawRequests, GeneratorDrawQueue, GeneratorMaterial};
use crate::readback::{ReadbackBufferPool, ReadbackQueue};
use crate::scheduler::{ClipmapScheduler, FenceQueue, TextureCopyQueue, planar};
use crate::settings::ClipmapTerrainSettings;
use crate::spawnable::{SpawnablePools, ViewCone};
use crate::texture_cache::TextureCacheGroups;
use bevy::app::{App, Plugin, PreUpdate, Update};
use bevy::asset::Assets;
use bevy::ecs::prelude::*;
use bevy::ecs::world::FromWorld;
use bevy::image::Image;
use bevy::log::{info, warn};
use bevy::math::{Vec2, Vec3};
use bevy::time::Time;
use bevy::transform::prelude::GlobalTransform;

/// 可生成物视锥替身的余弦半角 (120°)
/// Cosine half-angle of the spawnable view cone stand-in (120 degrees)
const VIEW_CONE_COS: f32 = 0.5;

/// 瓦片池系统的执行顺序: 碰撞先于可生成物
/// Execution order of the tile pool systems: collision before spawnables
#[derive(SystemSet, Debug, Clone, PartialEq, Eq, Hash)]
pub enum TerrainPoolSet {
    Collision,
    Spawnable,
}

/// 宿主提供的 Generator 动态材质; None = 仅视觉模式
/// Host-provided generator dynamic material; None = visual-only mode
#[derive(Resource, Default)]
pub struct TerrainGenerator(pub Option<GeneratorMaterial>);

/// 宿主提供的数据层配置
/// Host-provided data layer configuration
#[derive(Resource, Default)]
pub struct TerrainLayerConfig {
    pub layers: Vec<DataLayerDesc>,
}

/// 帧间的编排状态: 计时器, 搬迁保护, 重建标志
/// Cross-tick orchestration state: timers, relocation guard, rebuild flag
#[derive(Resource, Default)]
pub struct TerrainTickState {
    pub relocation_guard_until: f64,
    pub last_viewer_position: Option<Vec3>,
    /// 重建请求已发出但尚未执行
    /// A rebuild was requested and has not run yet
    pub rebuilding: bool,
    /// (碰撞开关, 垂直范围, 层级数) 的上一次快照
    /// Previous snapshot of (collision toggle, vertical range, level count)
    structural: Option<(bool, f32, u32)>,
}

impl FromWorld for CollisionTilePool {
    fn from_world(world: &mut World) -> Self {
        let settings = world.get_resource_or_init::<ClipmapTerrainSettings>();
        CollisionTilePool::new(&settings.collision)
    }
}

/// GPU 接口层: 请求队列与回读缓冲池
/// GPU interface layer: request queues and the readback buffer pool
pub struct ReadbackPlugin;

impl Plugin for ReadbackPlugin {
    fn build(&self, app: &mut App) {
        app.init_resource::<GeneratorDrawQueue>()
            .init_resource::<BrushRedrawRequests>()
            .init_resource::<ReadbackQueue>()
            .init_resource::<ReadbackBufferPool>()
            .init_resource::<TextureCopyQueue>()
            .init_resource::<FenceQueue>();
    }
}

/// clipmap 层级集与更新调度器
/// The clipmap level set and its update scheduler
pub struct ClipmapPlugin;

impl Plugin for ClipmapPlugin {
    fn build(&self, app: &mut App) {
        app.init_resource::<ClipmapTerrainSettings>()
            .init_resource::<TerrainGenerator>()
            .init_resource::<TerrainLayerConfig>()
            .init_resource::<ClipmapLevelSet>()
            .init_resource::<ClipmapScheduler>()
            .init_resource::<TextureCacheGroups>()
            .init_resource::<TerrainTickState>()
            .add_event::<TerrainRebuildRequested>()
            .register_type::<TerrainViewer>()
            .register_type::<TrackedViewpoint>()
            .register_type::<ClipmapTerrain>()
            .add_systems(
                PreUpdate,
                (
                    detect_structural_edits,
                    rebuild_terrain,
                    process_segmented_compute,
                    update_terrain,
                )
                    .chain(),
            );
    }
}

/// 碰撞瓦片池
/// The collision tile pool
pub struct CollisionTilePlugin;

impl Plugin for CollisionTilePlugin {
    fn build(&self, app: &mut App) {
        app.init_resource::<CollisionTilePool>()
            .add_systems(Update, manage_collision_tiles.in_set(TerrainPoolSet::Collision));
    }
}

/// 可生成物瓦片池
/// The spawnable tile pools
pub struct SpawnablePlugin;

impl Plugin for SpawnablePlugin {
    fn build(&self, app: &mut App) {
        app.init_resource::<SpawnablePools>()
            .init_resource::<TerrainStateCache>()
            .register_type::<TerrainStateCache>()
            .add_systems(
                Update,
                (manage_spawnables, refresh_state_cache)
                    .chain()
                    .in_set(TerrainPoolSet::Spawnable)
                    .after(TerrainPoolSet::Collision),
            );
    }
}

/// 结构性参数修改 → 完全重建, 绝不原地调整大小
/// Structural parameter edits → full rebuild, never a partial resize
fn detect_structural_edits(
    settings: Res<ClipmapTerrainSettings>,
    mut state: ResMut<TerrainTickState>,
    mut rebuilds: EventWriter<TerrainRebuildRequested>,
) {
    let signature = (
        settings.collision_enabled,
        settings.vertical_range,
        settings.level_count,
    );
    match state.structural {
        None => state.structural = Some(signature),
        Some(previous) if previous != signature => {
            info!("structural terrain edit detected, requesting full rebuild");
            state.structural = Some(signature);
            state.rebuilding = true;
            rebuilds.write(TerrainRebuildRequested);
        }
        _ => {}
    }
}

/// 世界初始化与完全重建: 层级一起创建, 一起销毁
/// World init and full rebuild: levels are created and destroyed together
#[allow(clippy::too_many_arguments)]
fn rebuild_terrain(
    mut rebuilds: EventReader<TerrainRebuildRequested>,
    settings: Res<ClipmapTerrainSettings>,
    generator: Res<TerrainGenerator>,
    layer_config: Res<TerrainLayerConfig>,
    mut images: ResMut<Assets<Image>>,
    mut levels: ResMut<ClipmapLevelSet>,
    mut scheduler: ResMut<ClipmapScheduler>,
    mut collision: ResMut<CollisionTilePool>,
    mut spawnables: ResMut<SpawnablePools>,
    mut draw_queue: ResMut<GeneratorDrawQueue>,
    mut copy_queue: ResMut<TextureCopyQueue>,
    mut fences: ResMut<FenceQueue>,
    mut state: ResMut<TerrainTickState>,
) {
    let requested = rebuilds.read().count() > 0;
    let initial = levels.is_empty() && settings.enabled;
    if !requested && !initial {
        return;
    }
    if !settings.enabled {
        state.rebuilding = false;
        return;
    }
    *levels = ClipmapLevelSet::build(
        &settings,
        layer_config.layers.clone(),
        generator.0.as_ref(),
        &mut images,
    );
    *scheduler = ClipmapScheduler::default();
    collision.rebuild(&settings.collision);
    spawnables.rebuild_all(&settings.budgets);
    draw_queue.drain();
    copy_queue.requests.clear();
    fences.fences.clear();
    state.rebuilding = false;
    info!("terrain rebuilt with {} clipmap levels", levels.len());
}

fn process_segmented_compute(
    mut scheduler: ResMut<ClipmapScheduler>,
    mut levels: ResMut<ClipmapLevelSet>,
    mut copy_queue: ResMut<TextureCopyQueue>,
    mut fences: ResMut<FenceQueue>,
    mut buffer_pool: ResMut<ReadbackBufferPool>,
) {
    buffer_pool.update();
    scheduler.process_segmented_computation(&mut levels, &mut copy_queue, &mut fences);
}

/// 地形 + clipmap 管理: 分段管线空闲且最小间隔已过才进入
/// Terrain + clipmap management; enters only with the segmented pipeline
/// idle and the minimum interval elapsed
#[allow(clippy::too_many_arguments)]
fn update_terrain(
    time: Res<Time>,
    settings: Res<ClipmapTerrainSettings>,
    mut state: ResMut<TerrainTickState>,
    mut scheduler: ResMut<ClipmapScheduler>,
    mut levels: ResMut<ClipmapLevelSet>,
    mut draw_queue: ResMut<GeneratorDrawQueue>,
    mut brush: ResMut<BrushRedrawRequests>,
    collision: Res<CollisionTilePool>,
    viewers: Query<&GlobalTransform, With<TerrainViewer>>,
    anchors: Query<&GlobalTransform, With<ClipmapTerrain>>,
    mut rebuilds: EventWriter<TerrainRebuildRequested>,
) {
    if !settings.enabled || levels.is_empty() || state.rebuilding {
        return;
    }
    if !scheduler.is_idle() {
        return;
    }
    let now = time.elapsed_secs_f64();
    if scheduler.last_pass > 0.0 && now - scheduler.last_pass < settings.update_interval() as f64 {
        return;
    }
    let Ok(viewer) = viewers.single() else {
        return;
    };
    let camera = viewer.translation();
    let anchor = anchors
        .single()
        .map(|t| t.translation())
        .unwrap_or(Vec3::ZERO);

    // 大幅搬迁后的短暂保护, 避免重建抖动
    // Short guard after a large relocation to avoid rebuild thrash
    if let Some(previous) = state.last_viewer_position {
        let jump = (camera - previous).length();
        let threshold = settings.grid_spacing(0) * settings.n as f32 * 0.5;
        if jump > threshold {
            state.relocation_guard_until = now + settings.relocation_guard as f64;
        }
    }
    state.last_viewer_position = Some(camera);
    if now < state.relocation_guard_until {
        return;
    }

    let ground = settings
        .collision_enabled
        .then(|| collision.ground_distance(camera, &settings))
        .flatten();
    if let Err(err) = scheduler.update_clipmap(
        &mut levels,
        &settings,
        &mut draw_queue,
        &mut brush,
        camera,
        anchor,
        ground,
        now,
    ) {
        warn!("clipmap update failed: {err}, forcing full rebuild");
        state.rebuilding = true;
        rebuilds.write(TerrainRebuildRequested);
    }
}

#[allow(clippy::too_many_arguments)]
fn manage_collision_tiles(
    settings: Res<ClipmapTerrainSettings>,
    generator: Res<TerrainGenerator>,
    levels: Res<ClipmapLevelSet>,
    state: Res<TerrainTickState>,
    mut pool: ResMut<CollisionTilePool>,
    mut images: ResMut<Assets<Image>>,
    mut draw_queue: ResMut<GeneratorDrawQueue>,
    mut readbacks: ResMut<ReadbackQueue>,
    viewers: Query<&GlobalTransform, With<TerrainViewer>>,
    tracked: Query<&GlobalTransform, (With<TrackedViewpoint>, Without<TerrainViewer>)>,
) {
    if !pool.setup_ready(&settings, state.rebuilding, generator.0.as_ref()) {
        return;
    }
    let Some(generator) = generator.0.as_ref() else {
        return;
    };
    let Ok(viewer) = viewers.single() else {
        return;
    };
    // 主相机在前, 其后是显式跟踪的外部 actor
    // Main camera first, then the explicitly tracked external actors
    let mut viewpoints = vec![planar(viewer.translation())];
    viewpoints.extend(tracked.iter().map(|t| planar(t.translation())));

    let material_layer = settings.collision.material_layer.as_ref().and_then(|name| {
        let index = levels.layer_descs.iter().position(|l| &l.name == name)?;
        levels.levels.last().map(|level| level.data_layers[index].clone())
    });
    pool.dispatch(
        &settings,
        generator,
        &viewpoints,
        material_layer.as_ref(),
        &mut images,
        &mut draw_queue,
        &mut readbacks,
    );
    pool.gpu_preprocess(&settings);
    pool.finalize_work(&settings);
}

#[allow(clippy::too_many_arguments)]
fn manage_spawnables(
    time: Res<Time>,
    settings: Res<ClipmapTerrainSettings>,
    levels: Res<ClipmapLevelSet>,
    state: Res<TerrainTickState>,
    mut pools: ResMut<SpawnablePools>,
    mut images: ResMut<Assets<Image>>,
    mut draw_queue: ResMut<GeneratorDrawQueue>,
    mut readbacks: ResMut<ReadbackQueue>,
    viewers: Query<&GlobalTransform, With<TerrainViewer>>,
) {
    if !settings.enabled || state.rebuilding {
        return;
    }
    let Ok(viewer) = viewers.single() else {
        return;
    };
    let now = time.elapsed_secs_f64();
    let cameras = [planar(viewer.translation())];
    let (_, rotation, _) = viewer.to_scale_rotation_translation();
    let forward3 = rotation * Vec3::NEG_Z;
    let forward = Vec2::new(forward3.x, forward3.z);
    // 相机几乎垂直向下看时放弃锥体剔除
    // Give up cone culling when the camera looks almost straight down
    let view = (forward.length_squared() > 1e-4).then(|| ViewCone {
        apex: cameras[0],
        forward: forward.normalize(),
        cos_half_angle: VIEW_CONE_COS,
    });
    pools.update(
        &settings,
        &levels,
        &cameras,
        view.as_ref(),
        &mut images,
        &mut draw_queue,
        &mut readbacks,
    );
    pools.process_pending(&settings);
    pools.finalize_async_work(&settings, now);
    pools.update_collisions(&settings, &cameras, now);
}

fn refresh_state_cache(
    mut cache: ResMut<TerrainStateCache>,
    collision: Res<CollisionTilePool>,
    spawnables: Res<SpawnablePools>,
) {
    cache.clear();
    for id in collision.cache().used_ids() {
        cache.collision_tiles.insert(collision.cache().slot(id).location);
    }
    for pool in &spawnables.pools {
        for id in pool.cache().used_ids() {
            cache.spawnable_tiles.insert(pool.cache().slot(id).location);
        }
    }
}
