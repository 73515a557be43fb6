use crate::generator::GeneratorMaterial;
use crate::settings::ClipmapTerrainSettings;
use bevy::asset::{Assets, Handle, RenderAssetUsages};
use bevy::image::{Image, TextureFormatPixelInfo};
use bevy::math::{IVec2, Rect, Vec2};
use bevy::prelude::Resource;
use bevy::reflect::Reflect;
use bevy::render::render_resource::{
    Extent3d, TextureDimension, TextureFormat, TextureUsages,
};

/// 每个环的网格分段数: 带洞外环, 无洞实心, 4 个 L 形补角
/// Mesh sections per ring: ring with hole, solid no-hole, 4 L-shape fillers
pub const SECTION_COUNT: usize = 6;

pub const SECTION_RING_WITH_HOLE: usize = 0;
pub const SECTION_RING_SOLID: usize = 1;

/// 子环占据父环内洞的哪个象限
/// Which quadrant of the parent's inner hole the child ring occupies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Reflect)]
pub enum StitchConfig {
    BotLeft,
    TopLeft,
    BotRight,
    TopRight,
    NotVisible,
}

impl StitchConfig {
    /// 对应补角分段的下标 (2..=5)
    /// Index of the matching filler section (2..=5)
    pub fn filler_section(self) -> Option<usize> {
        match self {
            StitchConfig::BotLeft => Some(2),
            StitchConfig::TopLeft => Some(3),
            StitchConfig::BotRight => Some(4),
            StitchConfig::TopRight => Some(5),
            StitchConfig::NotVisible => None,
        }
    }

    fn from_signs(positive_x: bool, positive_y: bool) -> Self {
        match (positive_x, positive_y) {
            (false, false) => StitchConfig::BotLeft,
            (false, true) => StitchConfig::TopLeft,
            (true, false) => StitchConfig::BotRight,
            (true, true) => StitchConfig::TopRight,
        }
    }
}

/// 结构性错误, 触发粗粒度恢复 (完全重建) 而不是原地修补
/// Structural errors triggering coarse recovery (full rebuild), not repair
#[derive(Debug, Clone, PartialEq)]
pub enum TerrainRebuildError {
    /// 子环相对父环的偏移不是恰好一个父网格间距
    /// Child ring offset from its parent is not exactly one parent spacing
    StructuralInconsistency { level: u32, offset: Vec2 },
    /// 纹理尺寸溢出
    /// Texture size overflow
    TextureSize(String),
}

impl std::fmt::Display for TerrainRebuildError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TerrainRebuildError::StructuralInconsistency { level, offset } => write!(
                f,
                "structural inconsistency on level {level}: child offset {offset:?}"
            ),
            TerrainRebuildError::TextureSize(msg) => write!(f, "texture size error: {msg}"),
        }
    }
}

impl std::error::Error for TerrainRebuildError {}

/// 命名数据层描述 (材质 ID, 湿度, ...)
/// Named data layer description (material id, wetness, ...)
#[derive(Debug, Clone)]
pub struct DataLayerDesc {
    pub name: String,
    pub format: TextureFormat,
    /// 该层着色器需要采样父环的同名层以保证连续性
    /// The layer's shader samples the parent ring's layer for continuity
    pub needs_parent_layer: bool,
}

/// 一个 clipmap LOD 环
/// One clipmap LOD ring
#[derive(Debug, Clone)]
pub struct ClipmapLevel {
    pub level: u32,
    /// 相邻顶点间的世界距离 (厘米)
    /// World distance between adjacent vertices (centimeters)
    pub grid_spacing: f32,
    /// 环中心, 单位为本层 gridSpacing
    /// Ring center in units of this level's gridSpacing
    pub location: IVec2,
    pub config: StitchConfig,
    pub height_map: Handle<Image>,
    pub height_map_staging: Handle<Image>,
    pub normal_map: Handle<Image>,
    pub normal_map_staging: Handle<Image>,
    pub data_layers: Vec<Handle<Image>>,
    pub data_layers_staging: Vec<Handle<Image>>,
    pub section_visible: [bool; SECTION_COUNT],
    pub section_visible_staging: [bool; SECTION_COUNT],
    pub last_update_time: f64,
    /// None = 仅视觉, 无高度数据 / None = visual-only, no height data
    pub generator: Option<GeneratorMaterial>,
}

impl ClipmapLevel {
    pub fn world_center(&self) -> Vec2 {
        self.location.as_vec2() * self.grid_spacing
    }

    /// 本环在地面上的覆盖范围
    /// On-ground footprint of this ring
    pub fn footprint(&self, n: u32) -> Rect {
        let half = self.grid_spacing * n as f32 * 0.5;
        let center = self.world_center();
        Rect {
            min: center - Vec2::splat(half),
            max: center + Vec2::splat(half),
        }
    }

    /// 以 2×gridSpacing 为步长吸附的最近中心, 保证相机停留在内半区
    /// Nearest center on the 2×gridSpacing grid keeping the camera in the
    /// inner half
    pub fn recenter_target(&self, camera: Vec2) -> IVec2 {
        let step = 2.0 * self.grid_spacing;
        IVec2::new(
            (camera.x / step).round() as i32 * 2,
            (camera.y / step).round() as i32 * 2,
        )
    }

    /// 相机是否越过了一个网格间距, 需要重新定位
    /// Whether the camera moved beyond one grid spacing and a recenter is due
    pub fn needs_recenter(&self, camera: Vec2) -> bool {
        self.recenter_target(camera) != self.location
    }
}

/// 高度剔除决策
/// Altitude culling decision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SectionChoice {
    /// 整层剔除, 距离太远 / Level fully culled, too far to matter
    Culled,
    /// 显示无洞实心变体 / Show the solid no-hole variant
    Solid,
    /// 显示带洞变体, 子环会填补洞口 / Show the hole variant, a child fills it
    Hole,
}

/// §高度策略: 超过阈值整层剔除; 超过半阈值或最精细层用实心; 其余用带洞
/// Altitude policy: above the threshold the level is culled; above half of
/// it, or on the innermost level, solid; otherwise hole
pub fn section_choice(
    height: f32,
    level: u32,
    level_count: u32,
    grid_spacing: f32,
    n: u32,
    altitude_transition_factor: f32,
) -> SectionChoice {
    let threshold = grid_spacing * altitude_transition_factor * n as f32;
    if height > threshold && level > 0 {
        SectionChoice::Culled
    } else if height > threshold * 0.5 || level == level_count - 1 {
        SectionChoice::Solid
    } else {
        SectionChoice::Hole
    }
}

/// 由子环相对父环的位置推导父环的 L 形象限
/// Derive the parent's L-shape quadrant from the child position relative to it
///
/// The offset per axis must be zero or exactly one parent spacing (two child
/// spacings); anything else is a precision failure and forces a full rebuild.
pub fn stitch_config_for(
    parent_center: Vec2,
    child_center: Vec2,
    child_spacing: f32,
    camera: Vec2,
    level: u32,
) -> Result<StitchConfig, TerrainRebuildError> {
    let offset = child_center - parent_center;
    let epsilon = child_spacing * 0.01;
    for component in [offset.x, offset.y] {
        let magnitude = component.abs();
        if (magnitude - 2.0 * child_spacing).abs() > epsilon && magnitude > epsilon {
            return Err(TerrainRebuildError::StructuralInconsistency { level, offset });
        }
    }
    // 偏移为零的轴用相机所在侧决定象限
    // A zero-offset axis falls back to the camera side for quadrant choice
    let positive_x = if offset.x.abs() > epsilon {
        offset.x > 0.0
    } else {
        camera.x >= parent_center.x
    };
    let positive_y = if offset.y.abs() > epsilon {
        offset.y > 0.0
    } else {
        camera.y >= parent_center.y
    };
    Ok(StitchConfig::from_signs(positive_x, positive_y))
}

/// 全部 clipmap 层级. 层级一起创建, 一起销毁, 绝不部分调整大小.
/// The full clipmap level set. Levels are created together and destroyed
/// together on full rebuild, never partially resized.
///
/// Parent/child relations are index arithmetic on the flat array: the parent
/// of level i is level i-1. No back-pointers are stored.
#[derive(Resource, Default, Debug)]
pub struct ClipmapLevelSet {
    pub levels: Vec<ClipmapLevel>,
    pub layer_descs: Vec<DataLayerDesc>,
}

impl ClipmapLevelSet {
    /// 在世界 (重) 初始化时一次性创建所有层级与纹理
    /// Create all levels and their textures at world (re)initialization
    pub fn build(
        settings: &ClipmapTerrainSettings,
        layer_descs: Vec<DataLayerDesc>,
        generator: Option<&GeneratorMaterial>,
        images: &mut Assets<Image>,
    ) -> Self {
        let mut levels = Vec::with_capacity(settings.level_count as usize);
        for level in 0..settings.level_count {
            let mut make = |format: TextureFormat| {
                images.add(make_level_texture(settings, format))
            };
            let data_layers = layer_descs.iter().map(|l| make(l.format)).collect();
            let data_layers_staging = layer_descs.iter().map(|l| make(l.format)).collect();
            levels.push(ClipmapLevel {
                level,
                grid_spacing: settings.grid_spacing(level),
                location: IVec2::ZERO,
                config: StitchConfig::NotVisible,
                height_map: make(settings.height_texture_format),
                height_map_staging: make(settings.height_texture_format),
                normal_map: make(settings.normal_texture_format),
                normal_map_staging: make(settings.normal_texture_format),
                data_layers,
                data_layers_staging,
                section_visible: [false; SECTION_COUNT],
                section_visible_staging: [false; SECTION_COUNT],
                last_update_time: f64::NEG_INFINITY,
                generator: generator.cloned(),
            });
        }
        Self {
            levels,
            layer_descs,
        }
    }

    pub fn len(&self) -> usize {
        self.levels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }

    /// 包含给定范围的最精细层级, 从上次已知层级开始游走
    /// Finest level whose footprint contains the rect, walking from the
    /// previously known best level
    pub fn best_level_for(&self, rect: Rect, n: u32, start: usize) -> usize {
        if self.levels.is_empty() {
            return 0;
        }
        let mut best = start.min(self.levels.len() - 1);
        // 先向粗糙方向回退到一个包含它的层级
        // First back off towards coarse until the rect is contained
        while best > 0 && !contains_rect(self.levels[best].footprint(n), rect) {
            best -= 1;
        }
        // 再向精细方向推进, 只要更细的层级仍然完整包含它
        // Then advance towards fine while the finer level still contains it
        while best + 1 < self.levels.len()
            && contains_rect(self.levels[best + 1].footprint(n), rect)
        {
            best += 1;
        }
        best
    }
}

fn contains_rect(outer: Rect, inner: Rect) -> bool {
    outer.min.x <= inner.min.x
        && outer.min.y <= inner.min.y
        && outer.max.x >= inner.max.x
        && outer.max.y >= inner.max.y
}

fn make_level_texture(settings: &ClipmapTerrainSettings, format: TextureFormat) -> Image {
    let size = Extent3d {
        width: settings.texture_resolution.x,
        height: settings.texture_resolution.y,
        depth_or_array_layers: 1,
    };
    // 黑色清屏即 "过期高度" 的合法降级表现
    // Black-cleared is the legitimate degraded form of stale height data
    let fill = vec![0u8; format.pixel_size()];
    let mut image = Image::new_fill(
        size,
        TextureDimension::D2,
        &fill,
        format,
        RenderAssetUsages::RENDER_WORLD,
    );
    image.texture_descriptor.usage |= TextureUsages::COPY_SRC
        | TextureUsages::COPY_DST
        | TextureUsages::TEXTURE_BINDING
        | TextureUsages::RENDER_ATTACHMENT;
    image
}

#[cfg(test)]
mod tests {
    use super::*;

    fn level_with_spacing(spacing: f32) -> ClipmapLevel {
        ClipmapLevel {
            level: 3,
            grid_spacing: spacing,
            location: IVec2::ZERO,
            config: StitchConfig::NotVisible,
            height_map: Handle::default(),
            height_map_staging: Handle::default(),
            normal_map: Handle::default(),
            normal_map_staging: Handle::default(),
            data_layers: Vec::new(),
            data_layers_staging: Vec::new(),
            section_visible: [false; SECTION_COUNT],
            section_visible_staging: [false; SECTION_COUNT],
            last_update_time: 0.0,
            generator: None,
        }
    }

    #[test]
    fn camera_moving_one_spacing_recenters_by_two() {
        let level = level_with_spacing(100.0);
        // 正中心不触发 / Dead center does not trigger
        assert!(!level.needs_recenter(Vec2::ZERO));
        assert!(!level.needs_recenter(Vec2::new(99.0, 0.0)));
        // 恰好一个间距: 沿运动方向吸附 2×gridSpacing
        // Exactly one spacing: snap 2×gridSpacing along the motion
        let camera = Vec2::new(100.0, 0.0);
        assert!(level.needs_recenter(camera));
        assert_eq!(level.recenter_target(camera), IVec2::new(2, 0));
        let camera = Vec2::new(-100.0, -100.0);
        assert_eq!(level.recenter_target(camera), IVec2::new(-2, -2));
    }

    #[test]
    fn stitch_config_follows_child_offset_signs() {
        let spacing = 50.0;
        let parent = Vec2::ZERO;
        for (offset, expected) in [
            (Vec2::new(100.0, 100.0), StitchConfig::TopRight),
            (Vec2::new(-100.0, 100.0), StitchConfig::TopLeft),
            (Vec2::new(100.0, -100.0), StitchConfig::BotRight),
            (Vec2::new(-100.0, -100.0), StitchConfig::BotLeft),
        ] {
            let config = stitch_config_for(parent, offset, spacing, Vec2::ZERO, 1).unwrap();
            assert_eq!(config, expected);
        }
    }

    #[test]
    fn zero_offset_axis_uses_the_camera_side() {
        let config =
            stitch_config_for(Vec2::ZERO, Vec2::new(100.0, 0.0), 50.0, Vec2::new(0.0, -5.0), 1)
                .unwrap();
        assert_eq!(config, StitchConfig::BotRight);
    }

    #[test]
    fn off_grid_child_offset_forces_a_rebuild() {
        let err = stitch_config_for(Vec2::ZERO, Vec2::new(130.0, 100.0), 50.0, Vec2::ZERO, 2)
            .unwrap_err();
        assert!(matches!(
            err,
            TerrainRebuildError::StructuralInconsistency { level: 2, .. }
        ));
    }

    #[test]
    fn altitude_policy_culls_then_solidifies_then_holes() {
        // threshold = 100 × 2 × 64 = 12800
        let n = 64;
        assert_eq!(
            section_choice(20_000.0, 3, 8, 100.0, n, 2.0),
            SectionChoice::Culled
        );
        // 最粗糙层不会被整层剔除 / The coarsest level is never fully culled
        assert_eq!(
            section_choice(20_000.0, 0, 8, 100.0, n, 2.0),
            SectionChoice::Solid
        );
        assert_eq!(
            section_choice(7_000.0, 3, 8, 100.0, n, 2.0),
            SectionChoice::Solid
        );
        assert_eq!(
            section_choice(1_000.0, 3, 8, 100.0, n, 2.0),
            SectionChoice::Hole
        );
        // 最内层总是实心 / The innermost level is always solid
        assert_eq!(
            section_choice(1_000.0, 7, 8, 100.0, n, 2.0),
            SectionChoice::Solid
        );
    }

    #[test]
    fn best_level_walks_from_the_previous_answer() {
        let settings = ClipmapTerrainSettings {
            level_count: 4,
            base_grid_spacing: 100.0,
            n: 8,
            ..Default::default()
        };
        let mut images = Assets::<Image>::default();
        let set = ClipmapLevelSet::build(&settings, Vec::new(), None, &mut images);
        // footprints: level 0 = 6400, 1 = 3200, 2 = 1600, 3 = 800 wide
        let small = Rect::new(-100.0, -100.0, 100.0, 100.0);
        assert_eq!(set.best_level_for(small, settings.n, 0), 3);
        assert_eq!(set.best_level_for(small, settings.n, 3), 3);
        let wide = Rect::new(-1000.0, -1000.0, 1000.0, 1000.0);
        assert_eq!(set.best_level_for(wide, settings.n, 3), 1);
    }

    #[test]
    fn build_creates_every_texture_pair_up_front() {
        let settings = ClipmapTerrainSettings {
            level_count: 3,
            ..Default::default()
        };
        let layers = vec![DataLayerDesc {
            name: "material".into(),
            format: TextureFormat::Rgba8Unorm,
            needs_parent_layer: true,
        }];
        let mut images = Assets::<Image>::default();
        let set = ClipmapLevelSet::build(&settings, layers, None, &mut images);
        assert_eq!(set.len(), 3);
        // 每层: 高度+法线 各两份, 数据层两份 / per level: height+normal pairs, layer pairs
        assert_eq!(images.len(), 3 * (2 + 2 + 2));
        for level in &set.levels {
            assert_eq!(level.data_layers.len(), 1);
            assert_eq!(level.data_layers_staging.len(), 1);
        }
    }
}
