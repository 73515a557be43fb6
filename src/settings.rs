use bevy::math::UVec2;
use bevy::prelude::Resource;
use bevy::render::render_resource::TextureFormat;
use serde::{Deserialize, Serialize};

/// 地形系统的全局设置
/// Global settings for the clipmap terrain system
#[derive(Resource, Clone, Debug)]
pub struct ClipmapTerrainSettings {
    /// 是否启用地形系统
    /// Master switch for the whole terrain system
    pub enabled: bool,

    /// clipmap 层级数量 (0 = 最粗糙的外环)
    /// Number of clipmap levels (index 0 = coarsest outer ring)
    pub level_count: u32,

    /// 最精细层级相邻顶点间的世界距离 (厘米)
    /// World distance between adjacent vertices of the finest level (centimeters)
    pub base_grid_spacing: f32,

    /// 每个环边上的顶点数量
    /// Vertex count along one side of a ring
    pub n: u32,

    /// 每层高度/法线纹理的分辨率
    /// Resolution of the height/normal textures per level
    pub texture_resolution: UVec2,

    /// 高度纹理格式
    /// Texture format for height data
    pub height_texture_format: TextureFormat,

    /// 法线纹理格式
    /// Texture format for normal data
    pub normal_texture_format: TextureFormat,

    /// 解码整数高度到世界高度的除数
    /// Divisor converting the packed integer height to world height
    pub height_scale: f32,

    /// 地形的垂直范围 (厘米); 修改会触发完全重建
    /// Vertical range of the terrain (centimeters); edits trigger a full rebuild
    pub vertical_range: f32,

    /// 高度/LOD 切换系数, 乘以 gridSpacing × N 得到层级剔除高度
    /// Altitude factor; multiplied by gridSpacing × N to get the level cull height
    pub altitude_transition_factor: f32,

    /// 表面是否持续重绘 (例如水面)
    /// Whether the surface is continuously re-animated (e.g. water)
    pub animated_surface: bool,

    /// 持续动画表面最粗糙层的重绘间隔 (秒), 向精细层按几何级数递减
    /// Redraw interval of the coarsest level for animated surfaces (seconds),
    /// halving geometrically towards finer levels
    pub animated_update_delay: f32,

    /// 相机驱动更新的最小间隔 (秒)
    /// Minimum interval between camera-driven update passes (seconds)
    pub camera_update_rate: f32,

    /// 高度驱动更新的最小间隔 (秒), 仅用于持续动画表面
    /// Minimum interval between height-driven update passes (seconds),
    /// only for animated surfaces
    pub height_update_rate: f32,

    /// 大幅移动后重新定位的延迟保护 (秒)
    /// Guard delay after a large relocation before recentering resumes (seconds)
    pub relocation_guard: f32,

    /// 是否生成碰撞网格; 修改会触发完全重建
    /// Whether collision meshes are generated; edits trigger a full rebuild
    pub collision_enabled: bool,

    /// 时间与数量预算
    /// Time and count budgets
    pub budgets: TerrainBudgets,

    /// 碰撞瓦片池设置
    /// Collision tile pool settings
    pub collision: CollisionSettings,
}

/// 每帧软预算, 超出时剩余工作顺延到下一帧
/// Soft per-frame budgets; exceeding one defers remaining work to the next tick
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TerrainBudgets {
    /// 分段计算预算 (毫秒)
    /// Segmented compute budget (milliseconds)
    pub segmented_compute_ms: f32,
    /// 碰撞解码/上传预算 (毫秒)
    /// Collision decode/upload budget (milliseconds)
    pub collision_ms: f32,
    /// 可生成物最终化预算 (毫秒)
    /// Spawnable finalize budget (milliseconds)
    pub spawnable_finalize_ms: f32,
    /// 每个实例化组件的实例上限
    /// Instance cap per instanced component
    pub max_instances_per_component: u32,
    /// 启用碰撞的实例化组件的实例上限
    /// Instance cap per collision-enabled instanced component
    pub max_collision_instances_per_component: u32,
    /// 每个瓦片单帧上传的实例批大小
    /// Instances uploaded per tile per tick
    pub batch_update_count: u32,
    /// 碰撞代理组件的实例批大小
    /// Instances uploaded per collision proxy per tick
    pub collision_batch_update_count: u32,
    /// 可生成物每帧的绘制调用预算
    /// Spawnable draw call budget per tick
    pub spawnable_max_draw_calls: u32,
}

impl Default for TerrainBudgets {
    fn default() -> Self {
        Self {
            segmented_compute_ms: 1.25,
            collision_ms: 1.0,
            spawnable_finalize_ms: 1.5,
            max_instances_per_component: 16000,
            max_collision_instances_per_component: 1500,
            batch_update_count: 300,
            collision_batch_update_count: 75,
            spawnable_max_draw_calls: 8,
        }
    }
}

/// 碰撞瓦片池设置
/// Collision tile pool settings
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CollisionSettings {
    /// 围绕每个视点保持的 Chebyshev 环数
    /// Chebyshev rings kept populated around each tracked viewpoint
    pub grid_ring_number: i32,
    /// 每个碰撞瓦片覆盖的世界尺寸 (厘米)
    /// World extent covered by one collision tile (centimeters)
    pub tile_size: f32,
    /// 碰撞瓦片网格的顶点分辨率
    /// Vertex resolution of a collision tile mesh
    pub tile_resolution: u32,
    /// 每帧最多发出的碰撞纹理绘制数
    /// Collision texture draws issued per tick at most
    pub max_draw_calls_per_frame: u32,
    /// 从哪个数据层复制材质 ID 通道 (None = 不复制)
    /// Data layer the material-ID channel is copied from (None = skip)
    pub material_layer: Option<String>,
}

impl Default for CollisionSettings {
    fn default() -> Self {
        Self {
            grid_ring_number: 2,
            tile_size: 400.0,
            tile_resolution: 16,
            max_draw_calls_per_frame: 4,
            material_layer: None,
        }
    }
}

impl Default for ClipmapTerrainSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            level_count: 8,
            base_grid_spacing: 100.0,
            n: 64,
            texture_resolution: UVec2::splat(128),
            // R16Unorm 放不下 ±2^23 的打包高度, 按通道布局打包进 RGBA8
            // R16Unorm cannot hold the packed ±2^23 heights, pack into RGBA8 channels
            height_texture_format: TextureFormat::Rgba8Unorm,
            normal_texture_format: TextureFormat::Rgba8Unorm,
            height_scale: 100.0,
            vertical_range: 100_000.0,
            altitude_transition_factor: 2.0,
            animated_surface: false,
            animated_update_delay: 1.0,
            camera_update_rate: 0.033,
            height_update_rate: 0.1,
            relocation_guard: 0.5,
            collision_enabled: true,
            budgets: TerrainBudgets::default(),
            collision: CollisionSettings::default(),
        }
    }
}

impl ClipmapTerrainSettings {
    /// 层级 i 的网格间距: 2^(levels-1-i) × baseSpacing
    /// Grid spacing of level i: 2^(levels-1-i) × baseSpacing
    pub fn grid_spacing(&self, level: u32) -> f32 {
        debug_assert!(level < self.level_count);
        self.base_grid_spacing * (1u32 << (self.level_count - 1 - level)) as f32
    }

    /// 持续动画表面的每层重绘间隔, 粗糙层最长
    /// Per-level redraw interval for animated surfaces, longest on the coarsest level
    pub fn update_delay(&self, level: u32) -> f32 {
        debug_assert!(level < self.level_count);
        self.animated_update_delay / (1u32 << level) as f32
    }

    /// 两次更新轮询之间的最小间隔
    /// Minimum interval between two update passes
    pub fn update_interval(&self) -> f32 {
        if self.animated_surface {
            self.camera_update_rate.max(self.height_update_rate)
        } else {
            self.camera_update_rate
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grid_spacing_doubles_towards_coarse_levels() {
        let settings = ClipmapTerrainSettings {
            level_count: 4,
            base_grid_spacing: 100.0,
            ..Default::default()
        };
        assert_eq!(settings.grid_spacing(3), 100.0);
        assert_eq!(settings.grid_spacing(2), 200.0);
        assert_eq!(settings.grid_spacing(1), 400.0);
        assert_eq!(settings.grid_spacing(0), 800.0);
    }

    #[test]
    fn animated_update_delay_halves_towards_fine_levels() {
        let settings = ClipmapTerrainSettings {
            animated_update_delay: 2.0,
            ..Default::default()
        };
        assert_eq!(settings.update_delay(0), 2.0);
        assert_eq!(settings.update_delay(1), 1.0);
        assert_eq!(settings.update_delay(2), 0.5);
    }

    #[test]
    fn update_interval_uses_slowest_rate_for_animated_surfaces() {
        let mut settings = ClipmapTerrainSettings::default();
        settings.camera_update_rate = 0.05;
        settings.height_update_rate = 0.2;
        settings.animated_surface = false;
        assert_eq!(settings.update_interval(), 0.05);
        settings.animated_surface = true;
        assert_eq!(settings.update_interval(), 0.2);
    }
}
