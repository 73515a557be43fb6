use crate::budget::FrameBudget;
use crate::clipmap::ClipmapLevelSet;
use crate::generator::{GeneratorDrawQueue, GeneratorParams, GeneratorPass, GeneratorSeeds};
use crate::readback::{ReadbackHandle, ReadbackQueue, decode_spawn_texture};
use crate::ring_cache::{GridCoord, RingCacheManager, SlotId, chebyshev};
use crate::settings::{ClipmapTerrainSettings, TerrainBudgets};
use crate::texture_cache::{TextureCacheGroup, TextureKindDesc};
use async_channel::Receiver;
use bevy::asset::{Assets, Handle};
use bevy::image::Image;
use bevy::log::{debug, warn};
use bevy::math::{Rect, UVec2, Vec2, Vec3};
use bevy::prelude::Resource;
use bevy::render::render_resource::TextureFormat;
use bevy::tasks::{AsyncComputeTaskPool, TaskPool};
use serde::{Deserialize, Serialize};

/// 两次加速结构重建之间的最短间隔 (秒)
/// Minimum delay between two acceleration structure rebuilds (seconds)
const TREE_REBUILD_MIN_DELAY: f64 = 0.5;

/// 可生成物种类: 四种共享全部池/调度逻辑, 仅组件构建细节不同
/// Spawnable kind: the four kinds share all pool/scheduling logic and differ
/// only in component construction details
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SpawnableKind {
    Grass,
    Foliage,
    Mesh,
    Actor,
}

/// 剔除距离范围 (厘米)
/// Cull distance range (centimeters)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CullDistance {
    pub min: f32,
    pub max: f32,
}

/// 一个实例化品种 (网格/草/植被/actor 变体)
/// One instanced variety (mesh/grass/foliage/actor variant)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpawnableVariety {
    pub name: String,
    pub kind: SpawnableKind,
}

/// 可生成物配置, 非运行时状态
/// Spawnable configuration, not runtime state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpawnableDefinition {
    pub name: String,
    pub varieties: Vec<SpawnableVariety>,
    /// 每 100 m² 的实例数 / Instances per 100 m²
    pub density: f32,
    pub cull_distance: CullDistance,
    pub collision_enabled: bool,
    pub proximity_collision: bool,
    /// 足够靠近视点时允许原地位置修正, 跳过完整重算
    /// Allow in-place position fixup near the viewpoint, skipping a full regen
    pub position_can_be_adjusted_with_lod: bool,
}

/// 单个解码后的实例变换
/// One decoded instance transform
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InstanceTransform {
    pub translation: Vec3,
    pub yaw: f32,
    pub pitch: f32,
    pub roll: f32,
    pub scale: f32,
}

/// 池拥有的实例化网格组件替身 (引擎 HISM 的等价物)
/// Pool-owned instanced mesh component stand-in (engine HISM equivalent)
#[derive(Debug)]
pub struct InstancedMeshComponent {
    pub name: String,
    /// (所属元素槽位, 变换) / (owning element slot, transform)
    pub instances: Vec<(SlotId, InstanceTransform)>,
    /// 加速结构重建进行中, 暂停上传
    /// Acceleration structure rebuild in flight, uploads pause
    pub pending_rebuild: bool,
    pub last_tree_rebuild: f64,
    dirty: bool,
}

impl InstancedMeshComponent {
    fn new(name: String) -> Self {
        Self {
            name,
            instances: Vec::new(),
            pending_rebuild: false,
            last_tree_rebuild: f64::NEG_INFINITY,
            dirty: false,
        }
    }

    pub fn instance_count(&self) -> usize {
        self.instances.len()
    }

    fn push_instances(
        &mut self,
        slot: SlotId,
        transforms: impl Iterator<Item = InstanceTransform>,
    ) {
        self.instances.extend(transforms.map(|t| (slot, t)));
        self.dirty = true;
    }

    fn remove_element(&mut self, slot: SlotId) {
        let before = self.instances.len();
        self.instances.retain(|(owner, _)| *owner != slot);
        if self.instances.len() != before {
            self.dirty = true;
        }
    }

    fn request_tree_rebuild(&mut self, now: f64) {
        self.pending_rebuild = true;
        self.last_tree_rebuild = now;
        self.dirty = false;
    }

    fn complete_tree_rebuild(&mut self, now: f64) {
        // 轮询式完成: 一帧之后视为重建结束
        // Polled completion: the rebuild counts as done one frame later
        if self.pending_rebuild && now > self.last_tree_rebuild {
            self.pending_rebuild = false;
        }
    }
}

/// 元素状态机
/// Element state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpawnElementState {
    /// 已分配, 等待 GPU 密度/变换计算 / Allocated, compute draw outstanding
    PendingComputeDraw,
    /// 计算已发出, 等待回读 / Compute issued, waiting on readback
    PendingReadback,
    /// 后台解码任务在途 / Background decode task in flight
    Decoding,
    /// 分批上传实例缓冲中 / Instance buffers uploading in batches
    PendingUpload,
    Active,
}

/// 一个可生成物瓦片元素
/// One spawnable tile element
#[derive(Debug)]
pub struct SpawnableTileElement {
    pub location: GridCoord,
    pub density_texture: Handle<Image>,
    pub transform_texture: Handle<Image>,
    pub state: SpawnElementState,
    readback: Option<ReadbackHandle>,
    /// 每品种一个解码后的变换数组 / One decoded transform array per variety
    pub decoded: Vec<Vec<InstanceTransform>>,
    /// 每品种的分段上传游标 / Per-variety partial upload cursor
    pub offset_of_segmented_update: Vec<usize>,
    pub best_level: usize,
    /// 邻近碰撞子池中的链接元素 / Linked element in the proximity sub-pool
    pub proximity_collision: Option<SlotId>,
}

/// 碰撞实例索引 → (元素, 品种, 实例) 的重定向记录
/// Redirect record from a collision instance index back to its source
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CollisionInstanceRef {
    pub element: SlotId,
    pub variety: usize,
    pub instance: usize,
}

#[derive(Debug)]
struct ProximityLink {
    element_slot: SlotId,
    /// 每品种已镜像的实例数 / Mirrored instance count per variety
    uploaded: Vec<usize>,
}

/// 近距物理交互的隐藏碰撞代理子池
/// Hidden collision proxy sub-pool for near-camera physical interaction
#[derive(Debug)]
pub struct ProximityPool {
    cache: RingCacheManager,
    links: Vec<Option<ProximityLink>>,
    pub components: Vec<InstancedMeshComponent>,
    /// 每品种与组件实例平行的重定向表 / Per-variety redirect table parallel
    /// to the component instances
    pub redirect: Vec<Vec<CollisionInstanceRef>>,
}

impl ProximityPool {
    fn new(definition: &SpawnableDefinition) -> Self {
        let components = definition
            .varieties
            .iter()
            .map(|v| InstancedMeshComponent::new(format!("{} {} (collision)", definition.name, v.name)))
            .collect::<Vec<_>>();
        let redirect = definition.varieties.iter().map(|_| Vec::new()).collect();
        Self {
            cache: RingCacheManager::new(1, None),
            links: Vec::new(),
            components,
            redirect,
        }
    }

    /// 命中解析: 碰撞实例索引回溯到来源
    /// Hit resolution: map a collision instance index back to its source
    pub fn resolve_hit(&self, variety: usize, instance: usize) -> Option<CollisionInstanceRef> {
        self.redirect.get(variety)?.get(instance).copied()
    }

    fn unlink(&mut self, slot: SlotId) -> Option<SlotId> {
        let link = self.links.get_mut(slot)?.take()?;
        for (component, redirect) in self.components.iter_mut().zip(self.redirect.iter_mut()) {
            redirect.retain(|r| r.element != link.element_slot);
            component.remove_element(link.element_slot);
        }
        Some(link.element_slot)
    }
}

/// 平面视锥替身: 以视点为顶点的圆锥测试
/// Planar frustum stand-in: a cone test from the viewpoint
#[derive(Debug, Clone, Copy)]
pub struct ViewCone {
    pub apex: Vec2,
    pub forward: Vec2,
    pub cos_half_angle: f32,
}

impl ViewCone {
    pub fn contains(&self, point: Vec2) -> bool {
        let to = point - self.apex;
        if to.length_squared() < 1.0 {
            return true;
        }
        to.normalize().dot(self.forward) >= self.cos_half_angle
    }
}

type DecodedTile = Vec<Vec<InstanceTransform>>;

/// 每个可生成物定义一个瓦片池
/// One tile pool per spawnable definition
#[derive(Debug)]
pub struct SpawnablePool {
    pub definition: SpawnableDefinition,
    pub grid_size_meters: f32,
    pub number_grid_rings: i32,
    /// 变换纹理的纹素边长 (每记录 2×2) / Transform texture side (2×2 per record)
    record_texture_size: u32,
    /// 槽位缓存 + 每槽位的 密度/变换 纹理组
    /// The slot cache plus the per-slot density/transform texture group
    textures: TextureCacheGroup,
    elements: Vec<Option<SpawnableTileElement>>,
    pub components: Vec<InstancedMeshComponent>,
    pending_decodes: Vec<(SlotId, Receiver<DecodedTile>)>,
    pub proximity: Option<ProximityPool>,
    needs_rebuild: bool,
}

impl SpawnablePool {
    /// 推导网格尺寸与环数并分配组件
    /// Derive grid size and ring count and allocate the components
    ///
    /// Grid sizes are searched small to large; the largest cell keeping the
    /// predicted instances-per-cell under the component cap wins (a lower cap
    /// applies when collision is enabled). Ring count follows from the cull
    /// distance, clamped to [1, 30].
    pub fn initiate(definition: SpawnableDefinition, budgets: &TerrainBudgets) -> Self {
        let cap = if definition.collision_enabled {
            budgets.max_collision_instances_per_component
        } else {
            budgets.max_instances_per_component
        } as f32;
        let mut grid_size_meters = 1.0f32;
        while grid_size_meters < 1024.0
            && predicted_instances(definition.density, grid_size_meters * 2.0) <= cap
        {
            grid_size_meters *= 2.0;
        }
        let cull_meters = definition.cull_distance.max / 100.0;
        let number_grid_rings = ((cull_meters / grid_size_meters).ceil() as i32).clamp(1, 30);

        let per_cell = predicted_instances(definition.density, grid_size_meters).max(1.0);
        let blocks = (per_cell.sqrt().ceil() as u32).max(1);
        let record_texture_size = blocks * 2;

        let components = definition
            .varieties
            .iter()
            .map(|v| InstancedMeshComponent::new(format!("{} {}", definition.name, v.name)))
            .collect();
        let proximity = definition
            .proximity_collision
            .then(|| ProximityPool::new(&definition));

        Self {
            textures: TextureCacheGroup::new(
                grid_size_meters,
                number_grid_rings,
                texture_kinds(record_texture_size),
                None,
            ),
            elements: Vec::new(),
            components,
            pending_decodes: Vec::new(),
            proximity,
            needs_rebuild: false,
            grid_size_meters,
            number_grid_rings,
            record_texture_size,
            definition,
        }
    }

    pub fn cache(&self) -> &RingCacheManager {
        self.textures.cache()
    }

    pub fn element(&self, slot: SlotId) -> Option<&SpawnableTileElement> {
        self.elements.get(slot).and_then(Option::as_ref)
    }

    /// 每瓦片的预计实例数 / Predicted instances per tile
    pub fn predicted_per_cell(&self) -> f32 {
        predicted_instances(self.definition.density, self.grid_size_meters)
    }

    /// 网格单元的世界边长 (厘米) / World extent of one cell (centimeters)
    pub fn cell_world_size(&self) -> f32 {
        self.grid_size_meters * 100.0
    }

    pub fn world_to_cell(&self, world: Vec2) -> GridCoord {
        self.textures.world_to_grid(world)
    }

    fn cell_footprint(&self, location: GridCoord) -> Rect {
        let cell = self.cell_world_size();
        let center = location.as_vec2() * cell;
        Rect {
            min: center - Vec2::splat(cell * 0.5),
            max: center + Vec2::splat(cell * 0.5),
        }
    }

    /// 环内缺失单元的分配 + GPU 计算派发, 受全局绘制预算限制
    /// Allocate missing cells and dispatch their compute, bounded by the
    /// global draw budget
    #[allow(clippy::too_many_arguments)]
    fn fill_cells(
        &mut self,
        settings: &ClipmapTerrainSettings,
        levels: &ClipmapLevelSet,
        refs: &[GridCoord],
        max_radius: Option<i32>,
        mut admit: impl FnMut(GridCoord) -> bool,
        draws_left: &mut usize,
        images: &mut Assets<Image>,
        draw_queue: &mut GeneratorDrawQueue,
        readbacks: &mut ReadbackQueue,
    ) {
        let available = *draws_left;
        let mut allocated = 0usize;
        let work = self
            .textures
            .cache_mut()
            .collect_work_where(refs, max_radius, &mut admit, |_| {
                if allocated < available {
                    allocated += 1;
                    true
                } else {
                    false
                }
            });
        *draws_left -= work.len();
        for slot in work {
            let location = self.textures.cache().slot(slot).location;
            self.place_element(slot, location, images);
            self.update_spawnable_data(slot, settings, levels, draw_queue, readbacks);
        }
    }

    fn place_element(&mut self, slot: SlotId, location: GridCoord, images: &mut Assets<Image>) {
        // 纹理组在槽位首次使用时惰性构建密度/变换纹理
        // The texture group lazily builds the density/transform textures on
        // first use of the slot
        self.textures.ensure_slot_textures(slot, images);
        let density_texture = self.textures.textures(slot)[0].clone();
        let transform_texture = self.textures.textures(slot)[1].clone();
        while self.elements.len() <= slot {
            self.elements.push(None);
        }
        if self.elements[slot].is_none() {
            self.elements[slot] = Some(SpawnableTileElement {
                location,
                density_texture: density_texture.clone(),
                transform_texture: transform_texture.clone(),
                state: SpawnElementState::PendingComputeDraw,
                readback: None,
                decoded: Vec::new(),
                offset_of_segmented_update: Vec::new(),
                best_level: usize::MAX,
                proximity_collision: None,
            });
        }
        let element = self.elements[slot].as_mut().expect("placed above");
        element.location = location;
        element.density_texture = density_texture;
        element.transform_texture = transform_texture;
        element.state = SpawnElementState::PendingComputeDraw;
        element.readback = None;
        element.decoded.clear();
        element.offset_of_segmented_update.clear();
        element.proximity_collision = None;
    }

    /// 绑定最合适的 clipmap 层并发出一次密度/变换计算
    /// Bind the best matching clipmap level and issue one density/transform
    /// compute
    fn update_spawnable_data(
        &mut self,
        slot: SlotId,
        settings: &ClipmapTerrainSettings,
        levels: &ClipmapLevelSet,
        draw_queue: &mut GeneratorDrawQueue,
        readbacks: &mut ReadbackQueue,
    ) {
        let record_texture_size = self.record_texture_size;
        let density = self.definition.density;
        let (location, start) = {
            let Some(element) = self.elements[slot].as_ref() else {
                return;
            };
            let start = if element.best_level == usize::MAX {
                levels.len().saturating_sub(1)
            } else {
                element.best_level
            };
            (element.location, start)
        };
        let footprint = self.cell_footprint(location);
        let best = levels.best_level_for(footprint, settings.n, start);
        let element = self.elements[slot].as_mut().expect("present above");
        element.best_level = best;
        let mut seeds = GeneratorSeeds::default();
        if let Some(level) = levels.levels.get(element.best_level) {
            seeds
                .textures
                .push(("HeightCache".into(), level.height_map.clone()));
            seeds
                .textures
                .push(("NormalCache".into(), level.normal_map.clone()));
            seeds
                .scalars
                .push(("LevelGridScaling".into(), level.grid_spacing));
        } else {
            debug!("spawnable tile {location:?} has no clipmap level to bind");
        }
        seeds.scalars.push(("Density".into(), density));
        let cell = footprint.max.x - footprint.min.x;
        draw_queue.push(
            element.transform_texture.clone(),
            GeneratorPass::SpawnDensity,
            GeneratorParams {
                patch_location: (footprint.min + footprint.max) * 0.5,
                patch_full_size: cell,
                local_grid_scaling: cell / record_texture_size as f32,
                n: record_texture_size / 2,
                cache_res: record_texture_size,
                no_margin: true,
            },
            seeds,
            None,
        );
        element.readback = Some(readbacks.begin(element.transform_texture.clone()));
        element.state = SpawnElementState::PendingReadback;
    }

    /// 轮询回读并把解码排到后台任务, 受时间预算限制
    /// Poll readbacks and enqueue background decode jobs within budget
    pub fn process_pending(&mut self, settings: &ClipmapTerrainSettings) {
        let mut budget = FrameBudget::from_ms(settings.budgets.spawnable_finalize_ms);
        let resident: Vec<SlotId> = self.textures.cache().used_ids().collect();
        let varieties = self.definition.varieties.len().max(1);
        let record_texture_size = self.record_texture_size;
        let height_scale = settings.height_scale;
        for slot in resident {
            if budget.exhausted() {
                break;
            }
            let footprint = {
                let Some(element) = self.elements[slot].as_ref() else {
                    continue;
                };
                self.cell_footprint(element.location)
            };
            let Some(element) = self.elements[slot].as_mut() else {
                continue;
            };
            if element.state != SpawnElementState::PendingReadback {
                continue;
            }
            if !element.readback.as_mut().is_some_and(|r| r.poll()) {
                continue;
            }
            let Some(bytes) = element.readback.as_mut().and_then(|r| r.take_data()) else {
                continue;
            };
            element.readback = None;
            element.state = SpawnElementState::Decoding;

            let (tx, rx) = async_channel::bounded(1);
            let origin = footprint.min;
            let task_pool = AsyncComputeTaskPool::get_or_init(TaskPool::default);
            task_pool
                .spawn(async move {
                    let records = decode_spawn_texture(&bytes, record_texture_size, record_texture_size);
                    let mut per_variety: DecodedTile = vec![Vec::new(); varieties];
                    // 预先计算的实例→品种轮转指派
                    // The precomputed instance-to-variety round robin
                    for (index, record) in records.into_iter().enumerate() {
                        per_variety[index % varieties].push(InstanceTransform {
                            translation: Vec3::new(
                                origin.x + record.position_raw.x as f32 / height_scale,
                                record.position_raw.y as f32 / height_scale,
                                origin.y + record.position_raw.z as f32 / height_scale,
                            ),
                            yaw: record.yaw,
                            pitch: record.pitch,
                            roll: record.roll,
                            scale: record.scale,
                        });
                    }
                    let _ = tx.try_send(per_variety);
                })
                .detach();
            self.pending_decodes.push((slot, rx));
            budget.consume();
        }
    }

    /// 把完成的解码结果分批灌入实例化组件
    /// Drain finished decodes onto the instanced components in sub-batches
    pub fn finalize_async_work(&mut self, settings: &ClipmapTerrainSettings, now: f64) {
        if self.needs_rebuild {
            self.rebuild_vegetation();
        }
        // 收割后台解码 / Harvest background decodes
        let mut decodes = std::mem::take(&mut self.pending_decodes);
        decodes.retain(|(slot, rx)| match rx.try_recv() {
            Ok(per_variety) => {
                if let Some(element) = self.elements.get_mut(*slot).and_then(Option::as_mut) {
                    if element.state == SpawnElementState::Decoding {
                        element.offset_of_segmented_update = vec![0; per_variety.len()];
                        element.decoded = per_variety;
                        element.state = SpawnElementState::PendingUpload;
                    }
                }
                false
            }
            Err(async_channel::TryRecvError::Empty) => true,
            Err(async_channel::TryRecvError::Closed) => false,
        });
        self.pending_decodes = decodes;

        for component in &mut self.components {
            component.complete_tree_rebuild(now);
        }
        // 组件重建期间不做任何上传
        // No uploads while any target component rebuilds its tree
        if self.components.iter().any(|c| c.pending_rebuild) {
            return;
        }

        let mut budget = FrameBudget::from_ms(settings.budgets.spawnable_finalize_ms);
        let batch = settings.budgets.batch_update_count as usize;
        let resident: Vec<SlotId> = self.textures.cache().used_ids().collect();
        let mut violation = false;
        for slot in resident {
            if budget.exhausted() {
                break;
            }
            let Some(element) = self.elements.get_mut(slot).and_then(Option::as_mut) else {
                continue;
            };
            if element.state != SpawnElementState::PendingUpload {
                continue;
            }
            if element.decoded.len() != self.components.len() {
                warn!(
                    "decoded variety count {} does not match component count {}",
                    element.decoded.len(),
                    self.components.len()
                );
                violation = true;
                break;
            }
            let mut uploaded_this_tile = 0usize;
            let mut done = true;
            for variety in 0..element.decoded.len() {
                let list_len = element.decoded[variety].len();
                let offset = element.offset_of_segmented_update[variety];
                if offset > list_len {
                    warn!("upload cursor {offset} beyond decoded buffer {list_len}");
                    violation = true;
                    break;
                }
                let room = batch.saturating_sub(uploaded_this_tile);
                let take = (list_len - offset).min(room);
                if take > 0 {
                    self.components[variety].push_instances(
                        slot,
                        element.decoded[variety][offset..offset + take].iter().copied(),
                    );
                    element.offset_of_segmented_update[variety] += take;
                    uploaded_this_tile += take;
                }
                if element.offset_of_segmented_update[variety] < list_len {
                    done = false;
                }
            }
            if violation {
                break;
            }
            if done {
                element.state = SpawnElementState::Active;
            }
            budget.consume();
        }
        if violation {
            // 粗粒度恢复: 整体重建植被而不是细粒度修补
            // Coarse recovery: rebuild the vegetation rather than patch
            self.needs_rebuild = true;
            return;
        }

        // 全部工作排空且冷却结束后, 触发一次加速结构重建
        // Once all work drained and the cooldown passed, rebuild the tree
        let drained = self.pending_decodes.is_empty()
            && self.textures.cache().used_ids().all(|slot| {
                !matches!(
                    self.elements[slot].as_ref().map(|e| e.state),
                    Some(SpawnElementState::Decoding) | Some(SpawnElementState::PendingUpload)
                )
            });
        if drained {
            for component in &mut self.components {
                if component.dirty && now - component.last_tree_rebuild >= TREE_REBUILD_MIN_DELAY {
                    component.request_tree_rebuild(now);
                }
            }
        }
    }

    /// 邻近碰撞代理的镜像维护, 与主上传同样分批
    /// Maintain the proximity collision mirror, batched like the main upload
    pub fn update_spawnable_collisions(
        &mut self,
        settings: &ClipmapTerrainSettings,
        cameras: &[Vec2],
        now: f64,
    ) {
        let refs: Vec<GridCoord> = cameras.iter().map(|c| self.world_to_cell(*c)).collect();
        let Some(proximity) = self.proximity.as_mut() else {
            return;
        };
        for released in proximity.cache.release_beyond_range(&refs) {
            if let Some(element_slot) = proximity.unlink(released) {
                if let Some(element) =
                    self.elements.get_mut(element_slot).and_then(Option::as_mut)
                {
                    element.proximity_collision = None;
                }
            }
        }
        // 只认主池中已激活的元素 / Admit only active elements of the main pool
        let main_cache = self.textures.cache();
        let elements = &self.elements;
        let work = proximity.cache.collect_work_where(
            &refs,
            None,
            |cell| {
                main_cache.slot_at(cell).is_some_and(|slot| {
                    matches!(
                        elements.get(slot).and_then(Option::as_ref).map(|e| e.state),
                        Some(SpawnElementState::Active)
                    )
                })
            },
            |_| true,
        );
        for slot in work {
            let cell = proximity.cache.slot(slot).location;
            let element_slot = main_cache.slot_at(cell).expect("admitted above");
            while proximity.links.len() <= slot {
                proximity.links.push(None);
            }
            proximity.links[slot] = Some(ProximityLink {
                element_slot,
                uploaded: vec![0; self.definition.varieties.len()],
            });
            if let Some(element) = self.elements.get_mut(element_slot).and_then(Option::as_mut) {
                element.proximity_collision = Some(slot);
            }
        }

        for component in &mut proximity.components {
            component.complete_tree_rebuild(now);
        }
        if proximity.components.iter().any(|c| c.pending_rebuild) {
            return;
        }
        let batch = settings.budgets.collision_batch_update_count as usize;
        let mut budget = FrameBudget::from_ms(settings.budgets.spawnable_finalize_ms);
        let link_slots: Vec<SlotId> = proximity.cache.used_ids().collect();
        let mut any_dirty = false;
        for slot in link_slots {
            if budget.exhausted() {
                break;
            }
            let Some(link) = proximity.links.get_mut(slot).and_then(Option::as_mut) else {
                continue;
            };
            let Some(element) = self
                .elements
                .get(link.element_slot)
                .and_then(Option::as_ref)
            else {
                continue;
            };
            let mut uploaded_this_tile = 0usize;
            for (variety, list) in element.decoded.iter().enumerate() {
                let offset = link.uploaded[variety];
                let room = batch.saturating_sub(uploaded_this_tile);
                let take = (list.len().saturating_sub(offset)).min(room);
                if take == 0 {
                    continue;
                }
                for (index, transform) in
                    list[offset..offset + take].iter().enumerate()
                {
                    proximity.components[variety]
                        .push_instances(link.element_slot, std::iter::once(*transform));
                    proximity.redirect[variety].push(CollisionInstanceRef {
                        element: link.element_slot,
                        variety,
                        instance: offset + index,
                    });
                }
                link.uploaded[variety] += take;
                uploaded_this_tile += take;
                any_dirty = true;
            }
            if uploaded_this_tile > 0 {
                budget.consume();
            }
        }
        if any_dirty {
            for component in &mut proximity.components {
                if component.dirty && now - component.last_tree_rebuild >= TREE_REBUILD_MIN_DELAY {
                    component.request_tree_rebuild(now);
                }
            }
        }
    }

    /// 环外元素的释放: 连带失效其碰撞链接
    /// Release elements beyond range, invalidating their collision linkage
    pub fn release_beyond_range(&mut self, cameras: &[Vec2]) {
        let refs: Vec<GridCoord> = cameras.iter().map(|c| self.world_to_cell(*c)).collect();
        let released = self.textures.cache_mut().release_beyond_range(&refs);
        for slot in released {
            self.pending_decodes.retain(|(s, _)| *s != slot);
            for component in &mut self.components {
                component.remove_element(slot);
            }
            let proximity_slot = self
                .elements
                .get_mut(slot)
                .and_then(Option::as_mut)
                .and_then(|element| {
                    element.state = SpawnElementState::PendingComputeDraw;
                    element.readback = None;
                    element.decoded.clear();
                    element.offset_of_segmented_update.clear();
                    element.proximity_collision.take()
                });
            if let (Some(proximity), Some(p_slot)) = (self.proximity.as_mut(), proximity_slot) {
                proximity.unlink(p_slot);
                proximity.cache.release(p_slot);
            }
        }
    }

    /// 范围内但最佳层级变精细的元素: 近处原地修正, 其余按预算重算
    /// In-range elements whose best level got finer: fix up in place when
    /// close, otherwise recompute within budget
    pub fn refresh_lod(
        &mut self,
        settings: &ClipmapTerrainSettings,
        levels: &ClipmapLevelSet,
        camera_cell: GridCoord,
        draws_left: &mut usize,
        draw_queue: &mut GeneratorDrawQueue,
        readbacks: &mut ReadbackQueue,
    ) {
        let resident: Vec<SlotId> = self.textures.cache().used_ids().collect();
        for slot in resident {
            let (needs, location) = {
                let Some(element) = self.elements.get(slot).and_then(Option::as_ref) else {
                    continue;
                };
                if element.state != SpawnElementState::Active {
                    continue;
                }
                let footprint = self.cell_footprint(element.location);
                let best = levels.best_level_for(footprint, settings.n, element.best_level);
                (best != element.best_level, element.location)
            };
            if !needs {
                continue;
            }
            let close = chebyshev(location, camera_cell) <= 1;
            if self.definition.position_can_be_adjusted_with_lod && close {
                // 位置修正路径: 足够近时的漂移不可察觉, 跳过重算
                // Position fixup path: drift is imperceptible this close
                let footprint = self.cell_footprint(location);
                let element = self.elements[slot].as_mut().expect("resident");
                element.best_level =
                    levels.best_level_for(footprint, settings.n, element.best_level);
            } else if *draws_left > 0 {
                *draws_left -= 1;
                for component in &mut self.components {
                    component.remove_element(slot);
                }
                let element = self.elements[slot].as_mut().expect("resident");
                element.decoded.clear();
                element.offset_of_segmented_update.clear();
                element.state = SpawnElementState::PendingComputeDraw;
                self.update_spawnable_data(slot, settings, levels, draw_queue, readbacks);
            }
        }
    }

    /// 一致性违规后的整体植被重建
    /// Full vegetation rebuild after a consistency violation
    fn rebuild_vegetation(&mut self) {
        warn!(
            "spawnable {:?}: forcing a full vegetation rebuild",
            self.definition.name
        );
        self.textures = TextureCacheGroup::new(
            self.grid_size_meters,
            self.number_grid_rings,
            texture_kinds(self.record_texture_size),
            None,
        );
        self.elements.clear();
        self.pending_decodes.clear();
        for component in &mut self.components {
            component.instances.clear();
            component.dirty = true;
            component.pending_rebuild = false;
        }
        if let Some(proximity) = self.proximity.as_mut() {
            *proximity = ProximityPool::new(&self.definition);
        }
        self.needs_rebuild = false;
    }
}

fn predicted_instances(density: f32, grid_size_meters: f32) -> f32 {
    density * grid_size_meters * grid_size_meters / 100.0
}

fn texture_kinds(record_texture_size: u32) -> Vec<TextureKindDesc> {
    vec![
        TextureKindDesc::new(
            "density",
            UVec2::splat((record_texture_size / 2).max(2)),
            TextureFormat::Rgba8Unorm,
        ),
        TextureKindDesc::new(
            "transform",
            UVec2::splat(record_texture_size.max(2)),
            TextureFormat::Rgba8Unorm,
        ),
    ]
}

/// 所有可生成物池, 更新优先级在整个集合上排序
/// All spawnable pools; update priority is ordered across the whole set
#[derive(Resource, Default, Debug)]
pub struct SpawnablePools {
    pub pools: Vec<SpawnablePool>,
}

impl SpawnablePools {
    pub fn register(&mut self, definition: SpawnableDefinition, budgets: &TerrainBudgets) {
        self.pools.push(SpawnablePool::initiate(definition, budgets));
    }

    /// 完全重建: 保留定义, 丢弃所有运行时状态
    /// Full rebuild: keep the definitions, drop all runtime state
    pub fn rebuild_all(&mut self, budgets: &TerrainBudgets) {
        let definitions: Vec<SpawnableDefinition> =
            self.pools.drain(..).map(|pool| pool.definition).collect();
        for definition in definitions {
            self.register(definition, budgets);
        }
    }

    /// 每帧更新, 优先级: 碰撞环1 → 视锥内按剔除距离降序 → 视野外回填
    /// Per-tick update. Priority: collision ring 1 → in-frustum by descending
    /// cull distance → off-frustum fill
    #[allow(clippy::too_many_arguments)]
    pub fn update(
        &mut self,
        settings: &ClipmapTerrainSettings,
        levels: &ClipmapLevelSet,
        cameras: &[Vec2],
        view: Option<&ViewCone>,
        images: &mut Assets<Image>,
        draw_queue: &mut GeneratorDrawQueue,
        readbacks: &mut ReadbackQueue,
    ) {
        let mut draws_left = settings.budgets.spawnable_max_draw_calls as usize;
        for pool in &mut self.pools {
            pool.release_beyond_range(cameras);
        }

        // 阶段 1: 启用碰撞的池, 相机周围 1 环 (廉价且紧急)
        // Phase 1: collision-enabled pools, ring 1 around the camera
        for pool in &mut self.pools {
            if !pool.definition.collision_enabled {
                continue;
            }
            let refs: Vec<GridCoord> = cameras.iter().map(|c| pool.world_to_cell(*c)).collect();
            pool.fill_cells(
                settings,
                levels,
                &refs,
                Some(1),
                |_| true,
                &mut draws_left,
                images,
                draw_queue,
                readbacks,
            );
        }

        // 阶段 2: 视锥内, 剔除距离大的优先 (稳定排序)
        // Phase 2: in-frustum, far-reaching cull distances first (stable sort)
        let mut order: Vec<usize> = (0..self.pools.len()).collect();
        order.sort_by(|&a, &b| {
            self.pools[b]
                .definition
                .cull_distance
                .max
                .partial_cmp(&self.pools[a].definition.cull_distance.max)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        for &index in &order {
            let pool = &mut self.pools[index];
            let refs: Vec<GridCoord> = cameras.iter().map(|c| pool.world_to_cell(*c)).collect();
            let cell = pool.cell_world_size();
            pool.fill_cells(
                settings,
                levels,
                &refs,
                None,
                |coord| match view {
                    Some(cone) => cone.contains(coord.as_vec2() * cell),
                    None => true,
                },
                &mut draws_left,
                images,
                draw_queue,
                readbacks,
            );
        }

        // 阶段 3: 剩余预算花在视野外的预填充
        // Phase 3: spend the remaining budget pre-populating off-frustum
        if view.is_some() {
            for &index in &order {
                let pool = &mut self.pools[index];
                let refs: Vec<GridCoord> =
                    cameras.iter().map(|c| pool.world_to_cell(*c)).collect();
                pool.fill_cells(
                    settings,
                    levels,
                    &refs,
                    None,
                    |_| true,
                    &mut draws_left,
                    images,
                    draw_queue,
                    readbacks,
                );
            }
        }

        // 阶段 4: 范围内元素的 LOD 重评估
        // Phase 4: LOD re-evaluation for in-range elements
        let camera_planar = cameras.first().copied().unwrap_or(Vec2::ZERO);
        for pool in &mut self.pools {
            let camera_cell = pool.world_to_cell(camera_planar);
            pool.refresh_lod(
                settings,
                levels,
                camera_cell,
                &mut draws_left,
                draw_queue,
                readbacks,
            );
        }
    }

    pub fn process_pending(&mut self, settings: &ClipmapTerrainSettings) {
        for pool in &mut self.pools {
            pool.process_pending(settings);
        }
    }

    pub fn finalize_async_work(&mut self, settings: &ClipmapTerrainSettings, now: f64) {
        for pool in &mut self.pools {
            pool.finalize_async_work(settings, now);
        }
    }

    pub fn update_collisions(
        &mut self,
        settings: &ClipmapTerrainSettings,
        cameras: &[Vec2],
        now: f64,
    ) {
        for pool in &mut self.pools {
            pool.update_spawnable_collisions(settings, cameras, now);
        }
    }
}
