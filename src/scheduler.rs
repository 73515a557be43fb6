use crate::clipmap::{
    ClipmapLevelSet, SECTION_COUNT, SECTION_RING_SOLID, SECTION_RING_WITH_HOLE, SectionChoice,
    StitchConfig, TerrainRebuildError, section_choice, stitch_config_for,
};
use crate::generator::{
    BrushPass, BrushRedrawRequests, GeneratorDrawQueue, GeneratorParams, GeneratorPass,
    RenderFence,
};
use crate::settings::ClipmapTerrainSettings;
use bevy::asset::Handle;
use bevy::image::Image;
use bevy::log::debug;
use bevy::math::{Vec2, Vec3};
use bevy::prelude::Resource;

/// 分段计算管线状态
/// Segmented compute pipeline state
///
/// Segmented mode pipelines one clipmap update across two frames with a GPU
/// fence so the renderer-visible texture is never written mid-read. It is
/// used whenever the surface is not continuously animated; animated surfaces
/// bypass it and draw directly into the final textures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SegmentedComputeState {
    #[default]
    Idle,
    NeedsSegmentedCompute,
    WaitingOnFence,
    ReadyToFinalize,
}

/// staging → final 的 GPU 纹理复制请求, 由渲染驱动按顺序执行
/// Staging → final GPU texture copy requests, executed in order by the driver
#[derive(Resource, Default, Debug)]
pub struct TextureCopyQueue {
    pub requests: Vec<TextureCopyRequest>,
}

#[derive(Debug, Clone)]
pub struct TextureCopyRequest {
    pub src: Handle<Image>,
    pub dst: Handle<Image>,
}

/// 等待渲染侧发出信号的围栏
/// Fences awaiting a signal from the render side
#[derive(Resource, Default, Debug)]
pub struct FenceQueue {
    pub fences: Vec<RenderFence>,
}

impl FenceQueue {
    pub fn begin(&mut self) -> RenderFence {
        let fence = RenderFence::new();
        self.fences.push(fence.clone());
        fence
    }
}

/// clipmap 更新调度器: 每帧状态机
/// The clipmap update scheduler: a per-frame state machine
#[derive(Resource, Default, Debug)]
pub struct ClipmapScheduler {
    state: SegmentedComputeState,
    fence: Option<RenderFence>,
    /// 待提升的层级, 父层在前
    /// Levels awaiting staging→final promotion, parent first
    pending_finalize: Vec<u32>,
    /// 上一次完整更新轮询的时间
    /// Time of the previous full update pass
    pub last_pass: f64,
}

impl ClipmapScheduler {
    pub fn state(&self) -> SegmentedComputeState {
        self.state
    }

    /// 分段管线是否空闲 (可以进入新的更新轮询)
    /// Whether the segmented pipeline is idle (a new update pass may enter)
    pub fn is_idle(&self) -> bool {
        self.state == SegmentedComputeState::Idle
    }

    /// 每帧主算法: 高度计算, 层级剔除, 重新定位, 发出 Generator 绘制
    /// Per-tick main algorithm: altitude, level culling, recentering, and
    /// generator draw emission
    ///
    /// `ground_distance` overrides the altitude when collision is enabled so
    /// LOD tracks actual ground proximity rather than the anchor height.
    #[allow(clippy::too_many_arguments)]
    pub fn update_clipmap(
        &mut self,
        levels: &mut ClipmapLevelSet,
        settings: &ClipmapTerrainSettings,
        draw_queue: &mut GeneratorDrawQueue,
        brush: &mut BrushRedrawRequests,
        camera: Vec3,
        anchor: Vec3,
        ground_distance: Option<f32>,
        now: f64,
    ) -> Result<(), TerrainRebuildError> {
        let count = levels.len();
        if count == 0 {
            return Ok(());
        }
        let camera_planar = planar(camera);
        let height = ground_distance.unwrap_or((camera.y - anchor.y).abs());

        // 1. 每层的高度剔除决策 / Altitude choice per level
        let mut choices = Vec::with_capacity(count);
        for level in &levels.levels {
            choices.push(section_choice(
                height,
                level.level,
                settings.level_count,
                level.grid_spacing,
                settings.n,
                settings.altitude_transition_factor,
            ));
        }
        // 子环被剔除时父环不能留洞
        // A parent may not keep its hole when the child is culled
        for i in 0..count {
            let child_visible = i + 1 < count && choices[i + 1] != SectionChoice::Culled;
            if choices[i] == SectionChoice::Hole && !child_visible {
                choices[i] = SectionChoice::Solid;
            }
        }

        // 2. 重绘触发 + 重新定位 (粗→细) / Redraw triggers + recentering
        let mut redraw = vec![false; count];
        for (i, level) in levels.levels.iter_mut().enumerate() {
            if choices[i] == SectionChoice::Culled {
                continue;
            }
            // 新建层级从未绘制过, 强制首次重绘
            // A freshly built level has never drawn, force the first redraw
            let redrawing_because_of_init = !level.last_update_time.is_finite();
            let redrawing_because_of_camera = level.needs_recenter(camera_planar);
            let redrawing_because_of_time = settings.animated_surface
                && now - level.last_update_time >= settings.update_delay(level.level) as f64;
            let redrawing_because_of_brush = brush.intersects(level.footprint(settings.n));
            if redrawing_because_of_camera {
                level.location = level.recenter_target(camera_planar);
            }
            redraw[i] = redrawing_because_of_init
                || redrawing_because_of_camera
                || redrawing_because_of_time
                || redrawing_because_of_brush;
        }
        brush.clear();

        // 3. 依赖规则: 子层重绘时父层必须一同重算 (细→粗传播)
        // Dependency rule: a redrawing child forces its parent to recompute
        for i in (1..count).rev() {
            if redraw[i] && choices[i - 1] != SectionChoice::Culled {
                redraw[i - 1] = true;
            }
        }

        // 4. 父环 L 形象限 / Parent L-shape quadrants
        for i in 1..count {
            let parent_center = levels.levels[i - 1].world_center();
            let child = &levels.levels[i];
            if choices[i] == SectionChoice::Culled {
                levels.levels[i - 1].config = StitchConfig::NotVisible;
                continue;
            }
            let config = stitch_config_for(
                parent_center,
                child.world_center(),
                child.grid_spacing,
                camera_planar,
                child.level,
            )?;
            levels.levels[i - 1].config = config;
        }

        // 5. 分段可见性 / Staged section visibility
        for (i, level) in levels.levels.iter_mut().enumerate() {
            let mut sections = [false; SECTION_COUNT];
            match choices[i] {
                SectionChoice::Culled => {}
                SectionChoice::Solid => sections[SECTION_RING_SOLID] = true,
                SectionChoice::Hole => {
                    sections[SECTION_RING_WITH_HOLE] = true;
                    if let Some(filler) = level.config.filler_section() {
                        sections[filler] = true;
                    }
                }
            }
            level.section_visible_staging = sections;
        }

        // 6. 发出绘制, 父层先于子层 / Emit draws, parent before child
        let segmented = !settings.animated_surface;
        let mut issued = Vec::new();
        let ClipmapLevelSet {
            levels: level_vec,
            layer_descs,
        } = &mut *levels;
        for (i, level) in level_vec.iter_mut().enumerate() {
            if !redraw[i] {
                continue;
            }
            level.last_update_time = now;
            if level.generator.is_none() {
                // 合法的 "仅视觉" 降级: 保留过期的黑色高度数据
                // Legitimate visual-only degrade: stale black height data stays
                debug!("level {} has no generator material, skipping draws", i);
                continue;
            }
            issue_level_draws(level, layer_descs, settings, draw_queue, segmented);
            issued.push(i as u32);
        }

        if segmented && !issued.is_empty() {
            self.pending_finalize = issued;
            self.state = SegmentedComputeState::NeedsSegmentedCompute;
        } else {
            // 直接模式: 立即提升分段可见性 / Direct mode promotes visibility now
            for level in &mut levels.levels {
                level.section_visible = level.section_visible_staging;
            }
        }
        self.last_pass = now;
        Ok(())
    }

    /// 分段计算推进, 每次调用最多一次状态迁移. 返回管线是否空闲.
    /// Advance the segmented pipeline, at most one transition per call.
    /// Returns whether the pipeline is idle.
    pub fn process_segmented_computation(
        &mut self,
        levels: &mut ClipmapLevelSet,
        copy_queue: &mut TextureCopyQueue,
        fences: &mut FenceQueue,
    ) -> bool {
        match self.state {
            SegmentedComputeState::Idle => true,
            SegmentedComputeState::NeedsSegmentedCompute => {
                self.fence = Some(fences.begin());
                self.state = SegmentedComputeState::WaitingOnFence;
                false
            }
            SegmentedComputeState::WaitingOnFence => {
                let signaled = self.fence.as_ref().is_some_and(RenderFence::is_signaled);
                if signaled {
                    self.fence = None;
                    self.state = SegmentedComputeState::ReadyToFinalize;
                }
                false
            }
            SegmentedComputeState::ReadyToFinalize => {
                // 父层先于子层复制, 与发出绘制的顺序一致
                // Copy parent before child, the same order the draws were issued
                for &i in &self.pending_finalize {
                    let level = &mut levels.levels[i as usize];
                    copy_queue.requests.push(TextureCopyRequest {
                        src: level.height_map_staging.clone(),
                        dst: level.height_map.clone(),
                    });
                    copy_queue.requests.push(TextureCopyRequest {
                        src: level.normal_map_staging.clone(),
                        dst: level.normal_map.clone(),
                    });
                    for (src, dst) in level
                        .data_layers_staging
                        .iter()
                        .zip(level.data_layers.iter())
                    {
                        copy_queue.requests.push(TextureCopyRequest {
                            src: src.clone(),
                            dst: dst.clone(),
                        });
                    }
                }
                for level in &mut levels.levels {
                    level.section_visible = level.section_visible_staging;
                }
                self.pending_finalize.clear();
                self.state = SegmentedComputeState::Idle;
                true
            }
        }
    }
}

/// 3D 相机位置投影到地面平面 (x, z)
/// Project a 3D camera position onto the ground plane (x, z)
pub fn planar(position: Vec3) -> Vec2 {
    Vec2::new(position.x, position.z)
}

fn issue_level_draws(
    level: &mut crate::clipmap::ClipmapLevel,
    layer_descs: &[crate::clipmap::DataLayerDesc],
    settings: &ClipmapTerrainSettings,
    draw_queue: &mut GeneratorDrawQueue,
    segmented: bool,
) {
    let generator = level.generator.as_ref().expect("checked by caller");
    let seeds = generator.seeds.clone();
    let params = GeneratorParams {
        patch_location: level.world_center(),
        patch_full_size: level.grid_spacing * settings.n as f32,
        local_grid_scaling: level.grid_spacing,
        n: settings.n,
        cache_res: settings.texture_resolution.x,
        no_margin: false,
    };
    let brush = |is_layer_pass: bool, layer_name: Option<String>| BrushPass {
        footprint: level.footprint(settings.n),
        patch_location: params.patch_location,
        grid_spacing: level.grid_spacing,
        n: settings.n,
        is_collision_pass: false,
        is_layer_pass,
        layer_name,
    };
    let height_target = if segmented {
        level.height_map_staging.clone()
    } else {
        level.height_map.clone()
    };
    let normal_target = if segmented {
        level.normal_map_staging.clone()
    } else {
        level.normal_map.clone()
    };
    draw_queue.push(
        height_target,
        GeneratorPass::Height,
        params.clone(),
        seeds.clone(),
        Some(brush(false, None)),
    );
    draw_queue.push(
        normal_target,
        GeneratorPass::Normal,
        params.clone(),
        seeds.clone(),
        None,
    );
    for (index, desc) in layer_descs.iter().enumerate() {
        let target = if segmented {
            level.data_layers_staging[index].clone()
        } else {
            level.data_layers[index].clone()
        };
        draw_queue.push(
            target,
            GeneratorPass::DataLayer(desc.name.clone()),
            params.clone(),
            seeds.clone(),
            Some(brush(true, Some(desc.name.clone()))),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clipmap::DataLayerDesc;
    use crate::generator::GeneratorMaterial;
    use bevy::asset::Assets;
    use bevy::render::render_resource::TextureFormat;

    fn settings() -> ClipmapTerrainSettings {
        ClipmapTerrainSettings {
            level_count: 4,
            base_grid_spacing: 100.0,
            n: 64,
            animated_surface: false,
            ..Default::default()
        }
    }

    fn build_levels(settings: &ClipmapTerrainSettings) -> ClipmapLevelSet {
        let mut images = Assets::<Image>::default();
        ClipmapLevelSet::build(
            settings,
            vec![DataLayerDesc {
                name: "material".into(),
                format: TextureFormat::Rgba8Unorm,
                needs_parent_layer: false,
            }],
            Some(&GeneratorMaterial::default()),
            &mut images,
        )
    }

    fn run_update(
        scheduler: &mut ClipmapScheduler,
        levels: &mut ClipmapLevelSet,
        settings: &ClipmapTerrainSettings,
        draw_queue: &mut GeneratorDrawQueue,
        camera: Vec3,
        now: f64,
    ) {
        let mut brush = BrushRedrawRequests::default();
        scheduler
            .update_clipmap(
                levels, settings, draw_queue, &mut brush, camera, Vec3::ZERO, None, now,
            )
            .unwrap();
    }

    #[test]
    fn first_pass_draws_every_level_parent_first() {
        let settings = settings();
        let mut levels = build_levels(&settings);
        let mut scheduler = ClipmapScheduler::default();
        let mut draw_queue = GeneratorDrawQueue::default();
        run_update(
            &mut scheduler,
            &mut levels,
            &settings,
            &mut draw_queue,
            Vec3::new(50.0, 100.0, 50.0),
            0.0,
        );
        // 高度绘制按层级从粗到细, 顺序戳严格递增
        // Height draws go coarse to fine with strictly increasing stamps
        let heights: Vec<_> = draw_queue
            .requests()
            .iter()
            .filter(|r| r.pass == GeneratorPass::Height)
            .collect();
        assert_eq!(heights.len(), 4);
        for pair in heights.windows(2) {
            assert!(pair[0].sequence < pair[1].sequence);
        }
    }

    #[test]
    fn child_redraw_forces_parent_recompute_first() {
        let settings = settings();
        let mut levels = build_levels(&settings);
        let mut scheduler = ClipmapScheduler::default();
        let mut draw_queue = GeneratorDrawQueue::default();
        run_update(
            &mut scheduler,
            &mut levels,
            &settings,
            &mut draw_queue,
            Vec3::new(0.0, 100.0, 0.0),
            0.0,
        );
        let mut copy_queue = TextureCopyQueue::default();
        let mut fences = FenceQueue::default();
        while !scheduler.process_segmented_computation(&mut levels, &mut copy_queue, &mut fences) {
            for fence in fences.fences.drain(..) {
                fence.signal();
            }
        }
        draw_queue.drain();

        // 只移动最精细层: 恰好一个最细网格间距
        // Move only the finest level: exactly one fine grid spacing
        run_update(
            &mut scheduler,
            &mut levels,
            &settings,
            &mut draw_queue,
            Vec3::new(100.0, 100.0, 0.0),
            1.0,
        );
        let heights: Vec<_> = draw_queue
            .requests()
            .iter()
            .filter(|r| r.pass == GeneratorPass::Height)
            .collect();
        // 父层级联重算, 父先子后 / Parents cascade, parent stamped before child
        assert_eq!(heights.len(), 4);
        for pair in heights.windows(2) {
            assert!(pair[0].sequence < pair[1].sequence);
            assert!(pair[0].params.local_grid_scaling > pair[1].params.local_grid_scaling);
        }
    }

    #[test]
    fn camera_moving_one_spacing_recenters_level_by_two_spacings() {
        let settings = settings();
        let mut levels = build_levels(&settings);
        let mut scheduler = ClipmapScheduler::default();
        let mut draw_queue = GeneratorDrawQueue::default();
        run_update(
            &mut scheduler,
            &mut levels,
            &settings,
            &mut draw_queue,
            Vec3::new(0.0, 100.0, 0.0),
            0.0,
        );
        let level3_spacing = levels.levels[3].grid_spacing;
        assert_eq!(levels.levels[3].location, bevy::math::IVec2::ZERO);
        run_update(
            &mut scheduler,
            &mut levels,
            &settings,
            &mut draw_queue,
            Vec3::new(level3_spacing, 100.0, 0.0),
            1.0,
        );
        // §重定位规则: 沿运动方向移动 2×gridSpacing, 而不是原始增量
        // Recenter by 2×gridSpacing along the motion, not the raw delta
        assert_eq!(levels.levels[3].location, bevy::math::IVec2::new(2, 0));
    }

    #[test]
    fn segmented_pipeline_walks_fence_then_finalize() {
        let settings = settings();
        let mut levels = build_levels(&settings);
        let mut scheduler = ClipmapScheduler::default();
        let mut draw_queue = GeneratorDrawQueue::default();
        run_update(
            &mut scheduler,
            &mut levels,
            &settings,
            &mut draw_queue,
            Vec3::new(0.0, 100.0, 0.0),
            0.0,
        );
        assert_eq!(
            scheduler.state(),
            SegmentedComputeState::NeedsSegmentedCompute
        );
        // 可见性尚未提升 / Visibility is not promoted yet
        assert!(!levels.levels[3].section_visible.iter().any(|v| *v));

        let mut copy_queue = TextureCopyQueue::default();
        let mut fences = FenceQueue::default();
        assert!(!scheduler.process_segmented_computation(&mut levels, &mut copy_queue, &mut fences));
        assert_eq!(scheduler.state(), SegmentedComputeState::WaitingOnFence);
        // 围栏未发出信号时停留在等待态 / Stay waiting while the fence is silent
        assert!(!scheduler.process_segmented_computation(&mut levels, &mut copy_queue, &mut fences));
        assert_eq!(scheduler.state(), SegmentedComputeState::WaitingOnFence);

        fences.fences[0].signal();
        assert!(!scheduler.process_segmented_computation(&mut levels, &mut copy_queue, &mut fences));
        assert_eq!(scheduler.state(), SegmentedComputeState::ReadyToFinalize);
        assert!(scheduler.process_segmented_computation(&mut levels, &mut copy_queue, &mut fences));
        assert_eq!(scheduler.state(), SegmentedComputeState::Idle);
        // staging → final 复制: 每层 高度+法线+1数据层 / copies per level
        assert_eq!(copy_queue.requests.len(), 4 * 3);
        assert!(levels.levels[3].section_visible[SECTION_RING_SOLID]);
    }

    #[test]
    fn animated_surface_bypasses_the_segmented_pipeline() {
        let mut settings = settings();
        settings.animated_surface = true;
        settings.animated_update_delay = 1.0;
        let mut levels = build_levels(&settings);
        let mut scheduler = ClipmapScheduler::default();
        let mut draw_queue = GeneratorDrawQueue::default();
        run_update(
            &mut scheduler,
            &mut levels,
            &settings,
            &mut draw_queue,
            Vec3::new(0.0, 100.0, 0.0),
            10.0,
        );
        assert_eq!(scheduler.state(), SegmentedComputeState::Idle);
        // 直接模式立即提升可见性, 绘制目标是最终纹理
        // Direct mode promotes instantly and targets the final textures
        assert!(levels.levels[3].section_visible[SECTION_RING_SOLID]);
        let height = draw_queue
            .requests()
            .iter()
            .find(|r| r.pass == GeneratorPass::Height)
            .unwrap();
        assert_eq!(height.destination, levels.levels[0].height_map);
    }

    #[test]
    fn time_policy_redraws_fine_levels_more_often() {
        let mut settings = settings();
        settings.animated_surface = true;
        settings.animated_update_delay = 8.0;
        let mut levels = build_levels(&settings);
        let mut scheduler = ClipmapScheduler::default();
        let mut draw_queue = GeneratorDrawQueue::default();
        let camera = Vec3::new(0.0, 100.0, 0.0);
        run_update(&mut scheduler, &mut levels, &settings, &mut draw_queue, camera, 0.0);
        draw_queue.drain();
        // delay: 层0=8s, 层1=4s, 层2=2s, 层3=1s; t=2.5 时层 2 与 3 过期
        // At t=2.5 only levels 2 and 3 are past their cadence
        run_update(&mut scheduler, &mut levels, &settings, &mut draw_queue, camera, 2.5);
        let redrawn: Vec<u32> = draw_queue
            .requests()
            .iter()
            .filter(|r| r.pass == GeneratorPass::Height)
            .map(|r| (r.params.local_grid_scaling / settings.base_grid_spacing) as u32)
            .collect();
        // 时间触发的子层重绘级联到所有父层 / Time-triggered children cascade to parents
        assert_eq!(redrawn.len(), 4);
    }

    #[test]
    fn missing_generator_degrades_to_no_draws() {
        let settings = settings();
        let mut images = Assets::<Image>::default();
        let mut levels = ClipmapLevelSet::build(&settings, Vec::new(), None, &mut images);
        let mut scheduler = ClipmapScheduler::default();
        let mut draw_queue = GeneratorDrawQueue::default();
        run_update(
            &mut scheduler,
            &mut levels,
            &settings,
            &mut draw_queue,
            Vec3::new(0.0, 100.0, 0.0),
            0.0,
        );
        assert!(draw_queue.is_empty());
        assert_eq!(scheduler.state(), SegmentedComputeState::Idle);
        // 几何仍然定位与显示 / Geometry is still positioned and shown
        assert!(levels.levels[3].section_visible[SECTION_RING_SOLID]);
    }

    #[test]
    fn brush_redraw_hits_only_intersecting_levels_and_their_parents() {
        let settings = settings();
        let mut levels = build_levels(&settings);
        let mut scheduler = ClipmapScheduler::default();
        let mut draw_queue = GeneratorDrawQueue::default();
        run_update(
            &mut scheduler,
            &mut levels,
            &settings,
            &mut draw_queue,
            Vec3::new(0.0, 100.0, 0.0),
            0.0,
        );
        let mut copy_queue = TextureCopyQueue::default();
        let mut fences = FenceQueue::default();
        while !scheduler.process_segmented_computation(&mut levels, &mut copy_queue, &mut fences) {
            for fence in fences.fences.drain(..) {
                fence.signal();
            }
        }
        draw_queue.drain();

        // 画刷范围只与外层相交 (最精细层覆盖 ±3200)
        // Brush region beyond the finest footprint (finest covers ±3200)
        let mut brush = BrushRedrawRequests::default();
        brush.request(bevy::math::Rect::new(5000.0, 5000.0, 5100.0, 5100.0));
        scheduler
            .update_clipmap(
                &mut levels,
                &settings,
                &mut draw_queue,
                &mut brush,
                Vec3::new(0.0, 100.0, 0.0),
                Vec3::ZERO,
                None,
                1.0,
            )
            .unwrap();
        let spacings: Vec<f32> = draw_queue
            .requests()
            .iter()
            .filter(|r| r.pass == GeneratorPass::Height)
            .map(|r| r.params.local_grid_scaling)
            .collect();
        // 层 0 (±25600) 和层 1 (±12800) 相交; 层 2 (±6400) 也相交; 层 3 不相交
        // Levels 0..=2 intersect, level 3 does not
        assert_eq!(spacings.len(), 3);
        assert!(spacings.iter().all(|s| *s >= settings.grid_spacing(2)));
    }
}
