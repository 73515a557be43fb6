use crate::budget::FrameBudget;
use crate::generator::{
    BrushPass, GeneratorDrawQueue, GeneratorMaterial, GeneratorParams, GeneratorPass,
};
use crate::readback::{ReadbackHandle, ReadbackQueue, decode_collision_texture};
use crate::ring_cache::{GridCoord, RingCacheManager, SlotId};
use crate::settings::{ClipmapTerrainSettings, CollisionSettings};
use bevy::asset::{Assets, Handle, RenderAssetUsages};
use bevy::image::{Image, TextureFormatPixelInfo};
use bevy::log::warn;
use bevy::math::{Vec2, Vec3};
use bevy::platform::collections::HashSet;
use bevy::prelude::Resource;
use bevy::render::render_resource::{
    Extent3d, TextureDimension, TextureFormat, TextureUsages,
};
use bevy::tasks::{ComputeTaskPool, TaskPool};
use std::collections::VecDeque;

/// 每个碰撞瓦片的状态机
/// Per-tile state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollisionTileState {
    /// 已分配, 等待 GPU 纹理绘制 (受每帧绘制数限制)
    /// Allocated, awaiting its GPU texture draw (draw-call capped per tick)
    PendingTextureDraw,
    /// 绘制已发出, 等待异步回读完成
    /// Draw issued, waiting on the async readback
    PendingReadback,
    /// 回读完成, 等待 CPU 解码 (时间预算内)
    /// Readback arrived, waiting for the CPU convert (within budget)
    PendingCpuConvert,
    /// 解码完成, 等待网格区段上传
    /// Decoded, waiting for the mesh section upload
    PendingMeshUpload,
    Active,
}

/// 池拥有的程序化碰撞网格 (引擎网格组件的替身)
/// Pool-owned procedural collision mesh (stand-in for the engine component)
#[derive(Debug, Clone)]
pub struct CollisionMesh {
    pub resolution: u32,
    /// 每顶点世界高度, 行优先 / Per-vertex world heights, row major
    pub heights: Vec<f32>,
    pub materials: Vec<u8>,
}

impl CollisionMesh {
    fn new(resolution: u32) -> Self {
        let count = (resolution * resolution) as usize;
        Self {
            resolution,
            heights: vec![0.0; count],
            materials: vec![0; count],
        }
    }
}

/// 一个碰撞瓦片: 网格组件 + 工作纹理 + 待回读缓冲
/// One collision tile: mesh component + working texture + pending readback
#[derive(Debug)]
pub struct CollisionTile {
    pub location: GridCoord,
    /// 瓦片网格的世界位置 (平面中心) / World position of the tile mesh (planar center)
    pub mesh_location: Vec2,
    pub name: String,
    pub work_texture: Handle<Image>,
    pub state: CollisionTileState,
    pub mesh: CollisionMesh,
    readback: Option<ReadbackHandle>,
}

#[derive(Debug)]
struct MeshUpdate {
    slot: SlotId,
    heights: Vec<f32>,
    materials: Vec<u8>,
}

/// 碰撞瓦片池: 围绕所有被跟踪视点的环形 acquire/release
/// Collision tile pool: ring-based acquire/release around every tracked
/// viewpoint
///
/// Tiles are recycled, never destroyed on release; textures and meshes stay
/// with their slot. An in-flight readback of a released tile is allowed to
/// complete and is discarded against current pool membership.
#[derive(Resource, Debug)]
pub struct CollisionTilePool {
    cache: RingCacheManager,
    tiles: Vec<Option<CollisionTile>>,
    /// 整池共享的复制模板纹理 / Shared duplicate texture template for the pool
    template: Option<Image>,
    used_names: HashSet<String>,
    name_counter: u64,
    convert_ready: Vec<SlotId>,
    mesh_update_queue: VecDeque<MeshUpdate>,
}

impl CollisionTilePool {
    pub fn new(settings: &CollisionSettings) -> Self {
        Self {
            cache: RingCacheManager::new(settings.grid_ring_number, None),
            tiles: Vec::new(),
            template: None,
            used_names: HashSet::new(),
            name_counter: 0,
            convert_ready: Vec::new(),
            mesh_update_queue: VecDeque::new(),
        }
    }

    pub fn cache(&self) -> &RingCacheManager {
        &self.cache
    }

    pub fn tile(&self, slot: SlotId) -> Option<&CollisionTile> {
        self.tiles.get(slot).and_then(Option::as_ref)
    }

    pub fn active_count(&self) -> usize {
        self.cache
            .used_ids()
            .filter(|&id| {
                matches!(
                    self.tiles[id].as_ref().map(|t| t.state),
                    Some(CollisionTileState::Active)
                )
            })
            .count()
    }

    /// 完全重建: 丢弃所有瓦片与名字, 保留空池
    /// Full rebuild: drop every tile and name, keep the empty pool
    pub fn rebuild(&mut self, settings: &CollisionSettings) {
        *self = Self::new(settings);
    }

    /// 所有后续工作的门卫
    /// Gate for all further work
    pub fn setup_ready(
        &self,
        settings: &ClipmapTerrainSettings,
        rebuilding: bool,
        generator: Option<&GeneratorMaterial>,
    ) -> bool {
        settings.collision_enabled && !rebuilding && generator.is_some()
    }

    /// 环形 acquire/release + 受限的 GPU 绘制派发
    /// Ring acquire/release plus the draw-call capped GPU dispatch
    pub fn dispatch(
        &mut self,
        settings: &ClipmapTerrainSettings,
        generator: &GeneratorMaterial,
        viewpoints: &[Vec2],
        material_layer: Option<&Handle<Image>>,
        images: &mut Assets<Image>,
        draw_queue: &mut GeneratorDrawQueue,
        readbacks: &mut ReadbackQueue,
    ) {
        let tile_size = settings.collision.tile_size;
        let refs: Vec<GridCoord> = viewpoints
            .iter()
            .map(|v| world_to_tile(*v, tile_size))
            .collect();

        for released in self.cache.release_beyond_range(&refs) {
            if let Some(tile) = self.tiles.get_mut(released).and_then(Option::as_mut) {
                self.used_names.remove(&tile.name);
                // 在途回读继续完成, 结果被静默丢弃
                // An in-flight readback may finish; its result is discarded
                tile.state = CollisionTileState::PendingTextureDraw;
            }
        }

        let work = self.cache.collect_work(&refs);
        for slot in work {
            let location = self.cache.slot(slot).location;
            self.place_tile(slot, location, settings, images);
        }

        // 受每帧上限约束, 为等待绘制的瓦片发出 GPU 绘制
        // Issue GPU draws for waiting tiles, capped per tick
        let mut draws_left = settings.collision.max_draw_calls_per_frame;
        let resident: Vec<SlotId> = self.cache.used_ids().collect();
        for slot in resident {
            if draws_left == 0 {
                break;
            }
            let Some(tile) = self.tiles[slot].as_mut() else {
                continue;
            };
            if tile.state != CollisionTileState::PendingTextureDraw {
                continue;
            }
            let resolution = settings.collision.tile_resolution;
            let params = GeneratorParams {
                patch_location: tile.mesh_location,
                patch_full_size: tile_size,
                local_grid_scaling: tile_size / (resolution - 1).max(1) as f32,
                n: resolution,
                cache_res: resolution,
                no_margin: true,
            };
            let mut seeds = generator.seeds.clone();
            if let Some(layer) = material_layer {
                seeds
                    .textures
                    .push(("MaterialLayer".into(), layer.clone()));
            }
            let footprint = tile_footprint(tile.location, tile_size);
            draw_queue.push(
                tile.work_texture.clone(),
                GeneratorPass::CollisionHeight,
                params,
                seeds,
                Some(BrushPass {
                    footprint,
                    patch_location: tile.mesh_location,
                    grid_spacing: tile_size / (resolution - 1).max(1) as f32,
                    n: resolution,
                    is_collision_pass: true,
                    is_layer_pass: false,
                    layer_name: None,
                }),
            );
            tile.readback = Some(readbacks.begin(tile.work_texture.clone()));
            tile.state = CollisionTileState::PendingReadback;
            draws_left -= 1;
        }
    }

    /// 轮询回读并在时间预算内并行解码; 全部完成时返回 true
    /// Poll readbacks and decode in parallel within the time budget; returns
    /// true once nothing is pending
    pub fn gpu_preprocess(&mut self, settings: &ClipmapTerrainSettings) -> bool {
        let mut budget = FrameBudget::from_ms(settings.budgets.collision_ms);
        let resident: Vec<SlotId> = self.cache.used_ids().collect();
        for slot in &resident {
            let Some(tile) = self.tiles[*slot].as_mut() else {
                continue;
            };
            if tile.state != CollisionTileState::PendingReadback {
                continue;
            }
            if tile.readback.as_mut().is_some_and(|r| r.poll()) {
                tile.state = CollisionTileState::PendingCpuConvert;
                self.convert_ready.push(*slot);
            }
        }

        // 预算内组批, 跨瓦片并行解码 (每顶点工作彼此独立)
        // Batch within budget, decode tiles in parallel (per-vertex work is
        // independent)
        let mut batch = Vec::new();
        while let Some(&slot) = self.convert_ready.first() {
            if budget.exhausted() {
                break;
            }
            self.convert_ready.remove(0);
            let Some(tile) = self.tiles[slot].as_mut() else {
                continue;
            };
            let Some(bytes) = tile.readback.as_mut().and_then(|r| r.take_data()) else {
                continue;
            };
            tile.readback = None;
            batch.push((slot, bytes));
            budget.consume();
        }
        if !batch.is_empty() {
            let resolution = settings.collision.tile_resolution;
            let height_scale = settings.height_scale;
            let task_pool = ComputeTaskPool::get_or_init(TaskPool::default);
            let decoded = task_pool.scope(|scope| {
                for (slot, bytes) in batch {
                    scope.spawn(async move {
                        let (heights, materials) =
                            decode_collision_texture(&bytes, resolution, height_scale);
                        MeshUpdate {
                            slot,
                            heights,
                            materials,
                        }
                    });
                }
            });
            for update in decoded {
                if let Some(tile) = self.tiles[update.slot].as_mut() {
                    tile.state = CollisionTileState::PendingMeshUpload;
                }
                self.mesh_update_queue.push_back(update);
            }
        }

        let finished = self.convert_ready.is_empty()
            && self.cache.used_ids().all(|id| {
                !matches!(
                    self.tiles[id].as_ref().map(|t| t.state),
                    Some(CollisionTileState::PendingReadback)
                        | Some(CollisionTileState::PendingCpuConvert)
                )
            });
        finished
    }

    /// 在时间预算内把排队的网格区段更新应用到碰撞组件
    /// Apply queued mesh section updates to the live components within budget
    pub fn finalize_work(&mut self, settings: &ClipmapTerrainSettings) {
        let mut budget = FrameBudget::from_ms(settings.budgets.collision_ms);
        while let Some(update) = self.mesh_update_queue.front() {
            if budget.exhausted() {
                break;
            }
            let slot = update.slot;
            let update = self.mesh_update_queue.pop_front().expect("front checked");
            let Some(tile) = self.tiles[slot].as_mut() else {
                continue;
            };
            // 槽位可能已被重新指派; 过期结果直接丢弃
            // The slot may have been reassigned; stale results are dropped
            if tile.state != CollisionTileState::PendingMeshUpload
                || tile.mesh.heights.len() != update.heights.len()
            {
                continue;
            }
            tile.mesh.heights = update.heights;
            tile.mesh.materials = update.materials;
            tile.state = CollisionTileState::Active;
            budget.consume();
        }
    }

    /// 相机正下方最近激活瓦片的垂直距离, 用于 LOD 高度覆盖
    /// Vertical distance to the active tile under the camera, used as the
    /// LOD altitude override
    pub fn ground_distance(&self, camera: Vec3, settings: &ClipmapTerrainSettings) -> Option<f32> {
        let tile_size = settings.collision.tile_size;
        let planar = Vec2::new(camera.x, camera.z);
        let coord = world_to_tile(planar, tile_size);
        let slot = self.cache.slot_at(coord)?;
        let tile = self.tiles[slot].as_ref()?;
        if tile.state != CollisionTileState::Active {
            return None;
        }
        let resolution = tile.mesh.resolution;
        let min = tile.mesh_location - Vec2::splat(tile_size * 0.5);
        let step = tile_size / (resolution - 1).max(1) as f32;
        let ix = (((planar.x - min.x) / step).round() as i32).clamp(0, resolution as i32 - 1);
        let iz = (((planar.y - min.y) / step).round() as i32).clamp(0, resolution as i32 - 1);
        let height = tile.mesh.heights[(iz * resolution as i32 + ix) as usize];
        Some((camera.y - height).abs())
    }

    fn place_tile(
        &mut self,
        slot: SlotId,
        location: GridCoord,
        settings: &ClipmapTerrainSettings,
        images: &mut Assets<Image>,
    ) {
        while self.tiles.len() <= slot {
            self.tiles.push(None);
        }
        let tile_size = settings.collision.tile_size;
        let mesh_location = location.as_vec2() * tile_size;
        let name = self.unique_tile_name(location);
        if self.tiles[slot].is_none() {
            let image = self.template_image(settings).clone();
            self.tiles[slot] = Some(CollisionTile {
                location,
                mesh_location,
                name: String::new(),
                work_texture: images.add(image),
                state: CollisionTileState::PendingTextureDraw,
                mesh: CollisionMesh::new(settings.collision.tile_resolution),
                readback: None,
            });
        }
        // 池复用: 纹理与网格留在槽位上 / Pool reuse: texture and mesh stay on the slot
        let tile = self.tiles[slot].as_mut().expect("placed above");
        tile.location = location;
        tile.mesh_location = mesh_location;
        tile.name = name;
        tile.readback = None;
        tile.state = CollisionTileState::PendingTextureDraw;
    }

    fn template_image(&mut self, settings: &ClipmapTerrainSettings) -> &Image {
        self.template.get_or_insert_with(|| {
            let resolution = settings.collision.tile_resolution;
            let format = TextureFormat::Rgba8Unorm;
            let fill = vec![0u8; format.pixel_size()];
            let mut image = Image::new_fill(
                Extent3d {
                    width: resolution,
                    height: resolution,
                    depth_or_array_layers: 1,
                },
                TextureDimension::D2,
                &fill,
                format,
                RenderAssetUsages::RENDER_WORLD,
            );
            image.texture_descriptor.usage |= TextureUsages::COPY_SRC
                | TextureUsages::TEXTURE_BINDING
                | TextureUsages::RENDER_ATTACHMENT;
            image
        })
    }

    /// 带重试的唯一命名; 重试耗尽时退化为固定的 "failed renaming" 名并告警
    /// Unique naming with retries; falls back to a "failed renaming" name
    /// with a warning once retries run out
    fn unique_tile_name(&mut self, location: GridCoord) -> String {
        let base = format!("CollisionTile ({}, {})", location.x, location.y);
        if self.used_names.insert(base.clone()) {
            return base;
        }
        for _ in 0..8 {
            self.name_counter = self
                .name_counter
                .wrapping_mul(6364136223846793005)
                .wrapping_add(1442695040888963407);
            let suffix = (self.name_counter >> 33) as u32 & 0xFFFF;
            let candidate = format!("{base} #{suffix:04x}");
            if self.used_names.insert(candidate.clone()) {
                return candidate;
            }
        }
        self.name_counter = self.name_counter.wrapping_add(1);
        let fallback = format!("{base} failed renaming {}", self.name_counter);
        warn!("collision tile naming exhausted retries, using {fallback:?}");
        self.used_names.insert(fallback.clone());
        fallback
    }
}

fn world_to_tile(world: Vec2, tile_size: f32) -> GridCoord {
    GridCoord::new(
        (world.x / tile_size).round() as i32,
        (world.y / tile_size).round() as i32,
    )
}

fn tile_footprint(location: GridCoord, tile_size: f32) -> bevy::math::Rect {
    let center = location.as_vec2() * tile_size;
    bevy::math::Rect {
        min: center - Vec2::splat(tile_size * 0.5),
        max: center + Vec2::splat(tile_size * 0.5),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::readback::encode_height_texel;

    fn settings() -> ClipmapTerrainSettings {
        let mut settings = ClipmapTerrainSettings::default();
        settings.collision.grid_ring_number = 2;
        settings.collision.tile_resolution = 4;
        settings.collision.max_draw_calls_per_frame = 100;
        settings.budgets.collision_ms = 100.0;
        settings.height_scale = 100.0;
        settings
    }

    fn drive_to_steady_state(
        pool: &mut CollisionTilePool,
        settings: &ClipmapTerrainSettings,
        viewpoints: &[Vec2],
        images: &mut Assets<Image>,
    ) {
        let generator = GeneratorMaterial::default();
        for _ in 0..8 {
            let mut draw_queue = GeneratorDrawQueue::default();
            let mut readbacks = ReadbackQueue::default();
            pool.dispatch(
                settings,
                &generator,
                viewpoints,
                None,
                images,
                &mut draw_queue,
                &mut readbacks,
            );
            // 渲染驱动替身: 立即满足每个回读
            // Stand-in driver: satisfy every readback immediately
            let texel_count =
                (settings.collision.tile_resolution * settings.collision.tile_resolution) as usize;
            for request in readbacks.drain() {
                let mut bytes = Vec::with_capacity(texel_count * 4);
                for _ in 0..texel_count {
                    bytes.extend_from_slice(&encode_height_texel(500, 3));
                }
                request.tx.try_send(bytes).unwrap();
            }
            pool.gpu_preprocess(settings);
            pool.finalize_work(settings);
        }
    }

    #[test]
    fn steady_state_holds_exactly_the_ring_grid() {
        let settings = settings();
        let mut pool = CollisionTilePool::new(&settings.collision);
        let mut images = Assets::<Image>::default();
        drive_to_steady_state(&mut pool, &settings, &[Vec2::ZERO], &mut images);
        // (2×2+1)² = 25 个激活瓦片 / 25 active tiles
        assert_eq!(pool.active_count(), 25);
        assert_eq!(pool.cache().used_count(), 25);
        let tile = pool.tile(pool.cache().slot_at(GridCoord::ZERO).unwrap()).unwrap();
        assert_eq!(tile.state, CollisionTileState::Active);
        assert_eq!(tile.mesh.heights[0], 5.0);
        assert_eq!(tile.mesh.materials[0], 3);
    }

    #[test]
    fn draw_calls_are_capped_per_tick() {
        let mut settings = settings();
        settings.collision.max_draw_calls_per_frame = 3;
        let mut pool = CollisionTilePool::new(&settings.collision);
        let mut images = Assets::<Image>::default();
        let generator = GeneratorMaterial::default();
        let mut draw_queue = GeneratorDrawQueue::default();
        let mut readbacks = ReadbackQueue::default();
        pool.dispatch(
            &settings,
            &generator,
            &[Vec2::ZERO],
            None,
            &mut images,
            &mut draw_queue,
            &mut readbacks,
        );
        assert_eq!(draw_queue.len(), 3);
        assert_eq!(readbacks.len(), 3);
        // 其余瓦片保持等待绘制 / Remaining tiles stay waiting for their draw
        let waiting = pool
            .cache()
            .used_ids()
            .filter(|&id| pool.tile(id).unwrap().state == CollisionTileState::PendingTextureDraw)
            .count();
        assert_eq!(waiting, 22);
    }

    #[test]
    fn stalled_readback_never_blocks_other_tiles() {
        let settings = settings();
        let mut pool = CollisionTilePool::new(&settings.collision);
        let mut images = Assets::<Image>::default();
        let generator = GeneratorMaterial::default();
        let mut draw_queue = GeneratorDrawQueue::default();
        let mut readbacks = ReadbackQueue::default();
        pool.dispatch(
            &settings,
            &generator,
            &[Vec2::ZERO],
            None,
            &mut images,
            &mut draw_queue,
            &mut readbacks,
        );
        // 只满足除第一个之外的回读 / Satisfy every readback except the first
        let texel_count =
            (settings.collision.tile_resolution * settings.collision.tile_resolution) as usize;
        let requests = readbacks.drain();
        let stalled_slot = pool.cache().slot_at(GridCoord::ZERO).unwrap();
        for (i, request) in requests.iter().enumerate() {
            if i == 0 {
                continue;
            }
            let mut bytes = Vec::new();
            for _ in 0..texel_count {
                bytes.extend_from_slice(&encode_height_texel(100, 0));
            }
            request.tx.try_send(bytes).unwrap();
        }
        for _ in 0..4 {
            assert!(!pool.gpu_preprocess(&settings));
            pool.finalize_work(&settings);
        }
        // 第一个瓦片 (槽位 0 = 原点) 永不离开 PendingReadback, 其余全部激活
        // The first tile (origin) never leaves PendingReadback; the rest go active
        assert_eq!(
            pool.tile(stalled_slot).unwrap().state,
            CollisionTileState::PendingReadback
        );
        assert_eq!(pool.active_count(), 24);
    }

    #[test]
    fn leaving_the_ring_releases_and_recycles_tiles() {
        let settings = settings();
        let mut pool = CollisionTilePool::new(&settings.collision);
        let mut images = Assets::<Image>::default();
        drive_to_steady_state(&mut pool, &settings, &[Vec2::ZERO], &mut images);
        let slot_count = pool.cache().slot_count();
        // 远距离移动: 全部释放后在新位置复用同一批槽位
        // A far move releases everything and reuses the same slots
        let far = Vec2::new(100.0 * settings.collision.tile_size, 0.0);
        drive_to_steady_state(&mut pool, &settings, &[far], &mut images);
        assert_eq!(pool.active_count(), 25);
        assert_eq!(pool.cache().slot_count(), slot_count);
        assert!(pool.cache().slot_at(GridCoord::ZERO).is_none());
    }

    #[test]
    fn tracked_secondary_viewpoints_keep_their_rings() {
        let settings = settings();
        let mut pool = CollisionTilePool::new(&settings.collision);
        let mut images = Assets::<Image>::default();
        let second = Vec2::new(20.0 * settings.collision.tile_size, 0.0);
        drive_to_steady_state(&mut pool, &settings, &[Vec2::ZERO, second], &mut images);
        // collectWork 只服务第一个参考点, 但释放检查遍历全部视点
        // collectWork serves the first reference point only, release checks all
        assert_eq!(pool.active_count(), 25);
        drive_to_steady_state(&mut pool, &settings, &[second, Vec2::ZERO], &mut images);
        assert_eq!(pool.active_count(), 50);
    }

    #[test]
    fn ground_distance_tracks_the_active_tile_height() {
        let settings = settings();
        let mut pool = CollisionTilePool::new(&settings.collision);
        let mut images = Assets::<Image>::default();
        drive_to_steady_state(&mut pool, &settings, &[Vec2::ZERO], &mut images);
        // 所有顶点高度 = 5.0 / All vertex heights are 5.0
        let distance = pool
            .ground_distance(Vec3::new(0.0, 105.0, 0.0), &settings)
            .unwrap();
        assert_eq!(distance, 100.0);
    }

    #[test]
    fn duplicate_names_get_randomized_suffixes() {
        let settings = settings();
        let mut pool = CollisionTilePool::new(&settings.collision);
        let first = pool.unique_tile_name(GridCoord::new(1, 1));
        let second = pool.unique_tile_name(GridCoord::new(1, 1));
        assert_eq!(first, "CollisionTile (1, 1)");
        assert_ne!(first, second);
        assert!(second.starts_with("CollisionTile (1, 1) #"));
    }
}
