use bevy::asset::Handle;
use bevy::image::Image;
use bevy::math::{Rect, Vec2, Vec4};
use bevy::prelude::Resource;
use bevy::reflect::Reflect;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Generator 材质的命名种子参数
/// Named seed parameters bound on a generator material
#[derive(Debug, Clone, Default, Reflect)]
pub struct GeneratorSeeds {
    pub scalars: Vec<(String, f32)>,
    pub vectors: Vec<(String, Vec4)>,
    pub textures: Vec<(String, Handle<Image>)>,
}

/// 已实例化的 Generator 动态材质. 缺失表示 "仅视觉, 无高度数据" 模式.
/// An instantiated generator dynamic material. Absence is the legitimate
/// "visual-only, no height data" mode.
#[derive(Debug, Clone, Default, Reflect)]
pub struct GeneratorMaterial {
    pub seeds: GeneratorSeeds,
}

/// 一次 Generator 绘制的标准参数, 命名约定与着色器端一致
/// Standard parameters of one generator draw, names matching the shader side
#[derive(Debug, Clone, Reflect)]
pub struct GeneratorParams {
    pub patch_location: Vec2,
    pub patch_full_size: f32,
    pub local_grid_scaling: f32,
    pub n: u32,
    pub cache_res: u32,
    pub no_margin: bool,
}

/// 绘制通道种类
/// Draw pass kind
#[derive(Debug, Clone, PartialEq, Eq, Reflect)]
pub enum GeneratorPass {
    Height,
    Normal,
    /// 命名数据层 (材质 ID, 湿度, ...) / Named data layer (material id, wetness, ...)
    DataLayer(String),
    /// 碰撞瓦片高度采样 (可带材质 ID 通道复制)
    /// Collision tile height sample (optionally copying a material-id channel)
    CollisionHeight,
    /// 可生成物密度 + 变换编码纹理
    /// Spawnable density + packed transform texture
    SpawnDensity,
}

/// 由主世界填充, 请求外部 Generator 向目标纹理发出一次 GPU 绘制.
/// Populated by the main world to request one GPU draw into the destination
/// texture from the external generator.
#[derive(Debug, Clone, Reflect)]
pub struct GeneratorDrawRequest {
    pub destination: Handle<Image>,
    pub pass: GeneratorPass,
    pub params: GeneratorParams,
    pub seeds: GeneratorSeeds,
    /// 命中该区域的画刷操作随绘制一起应用
    /// Brush strokes hitting this footprint are applied with the draw
    pub brush: Option<BrushPass>,
    /// 入队顺序戳; 父层级必须先于子层级
    /// Enqueue order stamp; a parent level must precede its child
    pub sequence: u64,
}

/// Generator 绘制请求队列, 由渲染驱动按顺序消费
/// Generator draw request queue, drained in order by the render driver
#[derive(Resource, Default, Debug)]
pub struct GeneratorDrawQueue {
    requests: Vec<GeneratorDrawRequest>,
    next_sequence: u64,
}

impl GeneratorDrawQueue {
    /// 入队并返回顺序戳
    /// Enqueue and return the order stamp
    pub fn push(
        &mut self,
        destination: Handle<Image>,
        pass: GeneratorPass,
        params: GeneratorParams,
        seeds: GeneratorSeeds,
        brush: Option<BrushPass>,
    ) -> u64 {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        self.requests.push(GeneratorDrawRequest {
            destination,
            pass,
            params,
            seeds,
            brush,
            sequence,
        });
        sequence
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    pub fn requests(&self) -> &[GeneratorDrawRequest] {
        &self.requests
    }

    pub fn drain(&mut self) -> Vec<GeneratorDrawRequest> {
        std::mem::take(&mut self.requests)
    }
}

/// 画刷栈接口参数: 将相交的画刷操作应用到目标区域
/// Brush stack interface parameters: apply intersecting strokes to a region
#[derive(Debug, Clone, Reflect)]
pub struct BrushPass {
    pub footprint: Rect,
    pub patch_location: Vec2,
    pub grid_spacing: f32,
    pub n: u32,
    pub is_collision_pass: bool,
    pub is_layer_pass: bool,
    pub layer_name: Option<String>,
}

/// 外部画刷系统请求的重绘区域, 调度器每帧消费
/// Redraw regions requested by the external brush system, consumed per tick
#[derive(Resource, Default, Debug, Clone, Reflect)]
pub struct BrushRedrawRequests {
    pub regions: Vec<Rect>,
}

impl BrushRedrawRequests {
    pub fn request(&mut self, region: Rect) {
        self.regions.push(region);
    }

    /// 是否有区域与给定范围相交
    /// Whether any pending region intersects the given footprint
    pub fn intersects(&self, footprint: Rect) -> bool {
        self.regions
            .iter()
            .any(|r| !r.intersect(footprint).is_empty())
    }

    pub fn clear(&mut self) {
        self.regions.clear();
    }
}

/// GPU 围栏: 单写单读的原子标志, 只允许协作式轮询
/// GPU fence: single-writer/single-reader atomic flag, cooperative polling only
#[derive(Debug, Clone, Default)]
pub struct RenderFence {
    signaled: Arc<AtomicBool>,
}

impl RenderFence {
    pub fn new() -> Self {
        Self::default()
    }

    /// 由渲染侧在 GPU 工作完成后调用
    /// Called by the render side once the GPU work retired
    pub fn signal(&self) {
        self.signaled.store(true, Ordering::Release);
    }

    pub fn is_signaled(&self) -> bool {
        self.signaled.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> GeneratorParams {
        GeneratorParams {
            patch_location: Vec2::ZERO,
            patch_full_size: 100.0,
            local_grid_scaling: 1.0,
            n: 64,
            cache_res: 128,
            no_margin: false,
        }
    }

    #[test]
    fn draw_queue_sequences_are_strictly_increasing() {
        let mut queue = GeneratorDrawQueue::default();
        let a = queue.push(
            Handle::default(),
            GeneratorPass::Height,
            params(),
            GeneratorSeeds::default(),
            None,
        );
        let b = queue.push(
            Handle::default(),
            GeneratorPass::Normal,
            params(),
            GeneratorSeeds::default(),
            None,
        );
        assert!(a < b);
        assert_eq!(queue.len(), 2);
        queue.drain();
        let c = queue.push(
            Handle::default(),
            GeneratorPass::Height,
            params(),
            GeneratorSeeds::default(),
            None,
        );
        // 顺序戳跨 drain 保持单调 / Stamps stay monotonic across drains
        assert!(c > b);
    }

    #[test]
    fn brush_requests_match_intersecting_footprints_only() {
        let mut requests = BrushRedrawRequests::default();
        requests.request(Rect::new(0.0, 0.0, 10.0, 10.0));
        assert!(requests.intersects(Rect::new(5.0, 5.0, 20.0, 20.0)));
        assert!(!requests.intersects(Rect::new(11.0, 11.0, 20.0, 20.0)));
    }

    #[test]
    fn fence_signals_once_and_stays_signaled() {
        let fence = RenderFence::new();
        assert!(!fence.is_signaled());
        let render_side = fence.clone();
        render_side.signal();
        assert!(fence.is_signaled());
        assert!(fence.is_signaled());
    }
}
