use crate::ring_cache::{GridCoord, RingCacheManager, SlotId};
use bevy::asset::{Assets, Handle, RenderAssetUsages};
use bevy::image::{Image, TextureFormatPixelInfo};
use bevy::math::{UVec2, Vec2};
use bevy::platform::collections::HashMap;
use bevy::prelude::Resource;
use bevy::render::render_resource::{
    Extent3d, TextureDimension, TextureFormat, TextureUsages,
};

/// 参考点重算的节流间隔 (秒)
/// Throttle interval for reference point recomputation (seconds)
const REFERENCE_UPDATE_INTERVAL: f64 = 0.1;

/// 一个缓存组内的命名纹理种类
/// One named texture kind within a cache group
#[derive(Debug, Clone)]
pub struct TextureKindDesc {
    pub name: String,
    pub resolution: UVec2,
    pub format: TextureFormat,
}

impl TextureKindDesc {
    pub fn new(name: impl Into<String>, resolution: UVec2, format: TextureFormat) -> Self {
        Self {
            name: name.into(),
            resolution,
            format,
        }
    }
}

/// 纹理支持的槽位缓存组. 组内所有槽位拥有同形的每种类纹理数组;
/// 纹理在槽位首次使用时惰性创建, 这是唯一创建 GPU 资源的位置.
/// Texture-backed slot cache group. Every slot in a group owns an
/// identically-shaped per-kind texture array; textures are created lazily on
/// first use of a slot, the only point GPU resources are created.
#[derive(Debug)]
pub struct TextureCacheGroup {
    cache_size_meters: f32,
    cache: RingCacheManager,
    kinds: Vec<TextureKindDesc>,
    /// 槽位 id → 每种类一个纹理 / slot id → one texture per kind
    slot_textures: Vec<Vec<Handle<Image>>>,
    reference_points: Vec<GridCoord>,
    last_reference_update: f64,
}

impl TextureCacheGroup {
    pub fn new(
        cache_size_meters: f32,
        ring_count: i32,
        kinds: Vec<TextureKindDesc>,
        capacity: Option<usize>,
    ) -> Self {
        Self {
            cache_size_meters,
            cache: RingCacheManager::new(ring_count, capacity),
            kinds,
            slot_textures: Vec::new(),
            reference_points: Vec::new(),
            last_reference_update: f64::NEG_INFINITY,
        }
    }

    pub fn cache(&self) -> &RingCacheManager {
        &self.cache
    }

    pub fn cache_mut(&mut self) -> &mut RingCacheManager {
        &mut self.cache
    }

    pub fn kinds(&self) -> &[TextureKindDesc] {
        &self.kinds
    }

    pub fn reference_points(&self) -> &[GridCoord] {
        &self.reference_points
    }

    /// 相机世界位置 (平面) → 本组网格坐标
    /// Camera world position (planar) → this group's grid coordinate
    pub fn world_to_grid(&self, world: Vec2) -> GridCoord {
        let cell = self.cache_size_meters * 100.0;
        GridCoord::new(
            (world.x / cell).round() as i32,
            (world.y / cell).round() as i32,
        )
    }

    /// 节流地重算参考点. 返回是否真的更新了.
    /// Recompute reference points, throttled. Returns whether an update ran.
    pub fn update_reference_points(&mut self, now: f64, cameras: &[Vec2]) -> bool {
        if now - self.last_reference_update < REFERENCE_UPDATE_INTERVAL {
            return false;
        }
        self.last_reference_update = now;
        self.reference_points = cameras.iter().map(|c| self.world_to_grid(*c)).collect();
        true
    }

    /// 释放所有超出环数范围的槽位
    /// Release every slot beyond the ring range
    pub fn release_out_of_range(&mut self) {
        let refs = self.reference_points.clone();
        self.cache.release_beyond_range(&refs);
    }

    /// 为缺失的网格单元分配槽位, 并为首次使用的槽位构建整套纹理
    /// Allocate slots for missing cells and build the full texture set for
    /// slots used for the first time
    pub fn generate_within_range(&mut self, images: &mut Assets<Image>) -> Vec<SlotId> {
        let refs = self.reference_points.clone();
        let work = self.cache.collect_work(&refs);
        for &id in &work {
            self.ensure_slot_textures(id, images);
        }
        work
    }

    /// 槽位首次使用时构建每种类纹理; 返回是否真的新建了
    /// Build the per-kind textures on first use of a slot; returns whether
    /// construction actually ran
    pub fn ensure_slot_textures(&mut self, id: SlotId, images: &mut Assets<Image>) -> bool {
        if self.cache.slot(id).data.is_some() {
            return false;
        }
        while self.slot_textures.len() <= id {
            self.slot_textures.push(Vec::new());
        }
        let textures = self
            .kinds
            .iter()
            .map(|kind| images.add(make_cache_texture(kind)))
            .collect();
        self.slot_textures[id] = textures;
        self.cache.slot_mut(id).data = Some(id);
        true
    }

    /// 槽位的每种类纹理, 顺序与 kinds 一致
    /// Per-kind textures of a slot, in kinds order
    pub fn textures(&self, id: SlotId) -> &[Handle<Image>] {
        &self.slot_textures[id]
    }
}

fn make_cache_texture(kind: &TextureKindDesc) -> Image {
    let size = Extent3d {
        width: kind.resolution.x,
        height: kind.resolution.y,
        depth_or_array_layers: 1,
    };
    let fill = vec![0u8; kind.format.pixel_size()];
    let mut image = Image::new_fill(
        size,
        TextureDimension::D2,
        &fill,
        kind.format,
        RenderAssetUsages::RENDER_WORLD,
    );
    image.texture_descriptor.usage |= TextureUsages::COPY_SRC
        | TextureUsages::TEXTURE_BINDING
        | TextureUsages::RENDER_ATTACHMENT;
    image
}

/// 按 (缓存尺寸厘米, 环数) 分组的全部纹理缓存组
/// All texture cache groups, keyed by (cache size in centimeters, ring count)
#[derive(Resource, Default, Debug)]
pub struct TextureCacheGroups {
    pub groups: HashMap<(u32, i32), TextureCacheGroup>,
}

impl TextureCacheGroups {
    pub fn group_or_insert(
        &mut self,
        cache_size_meters: f32,
        ring_count: i32,
        kinds: impl FnOnce() -> Vec<TextureKindDesc>,
    ) -> &mut TextureCacheGroup {
        let key = ((cache_size_meters * 100.0) as u32, ring_count);
        self.groups
            .entry(key)
            .or_insert_with(|| TextureCacheGroup::new(cache_size_meters, ring_count, kinds(), None))
    }
}
