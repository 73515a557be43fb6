use bevy::log::warn;
use bevy::math::IVec2;
use bevy::platform::collections::HashMap;

/// 缓存网格坐标类型
/// Grid coordinate type used by all tile caches
pub type GridCoord = IVec2;

/// 槽位编号, 池内稳定
/// Slot id, stable within one pool
pub type SlotId = usize;

/// Chebyshev 距离: max(|Δx|, |Δy|), 环距离的定义
/// Chebyshev distance: max(|Δx|, |Δy|), defines "distance in rings"
pub fn chebyshev(a: GridCoord, b: GridCoord) -> i32 {
    (a.x - b.x).abs().max((a.y - b.y).abs())
}

/// 浮点比较容差, 吸收环距比较的噪声
/// Float comparison tolerance absorbing noise in ring distance checks
const RING_TOLERANCE: f32 = 0.1;

/// 尚未放置的槽位使用的哨兵坐标
/// Sentinel coordinate for slots that have not been placed yet
const UNPLACED: GridCoord = GridCoord::new(i32::MIN, i32::MIN);

/// 一个缓存元素: 编号, 网格位置, 不透明负载索引
/// One cache element: id, grid location, opaque payload index
#[derive(Debug, Clone)]
pub struct CacheSlot {
    pub id: SlotId,
    pub location: GridCoord,
    /// None = 数据未初始化, 负载在首次使用时惰性构建
    /// None = uninitialized data, payload is built lazily on first use
    pub data: Option<usize>,
}

/// 固定容量的环形槽位缓存. 不感知 GPU.
/// Fixed-capacity ring/slot cache. No GPU knowledge.
///
/// Slots are exclusively "available" or "used". The layout map holds a
/// back-reference (coordinate → slot id) and never ownership.
#[derive(Debug, Clone)]
pub struct RingCacheManager {
    ring_count: i32,
    /// None = 仅受内存限制 / None = unbounded (memory permitting)
    capacity: Option<usize>,
    slots: Vec<CacheSlot>,
    used: Vec<bool>,
    available: Vec<SlotId>,
    layout: HashMap<GridCoord, SlotId>,
}

impl RingCacheManager {
    pub fn new(ring_count: i32, capacity: Option<usize>) -> Self {
        Self {
            ring_count,
            capacity,
            slots: Vec::new(),
            used: Vec::new(),
            available: Vec::new(),
            layout: HashMap::new(),
        }
    }

    pub fn ring_count(&self) -> i32 {
        self.ring_count
    }

    pub fn slot(&self, id: SlotId) -> &CacheSlot {
        &self.slots[id]
    }

    pub fn slot_mut(&mut self, id: SlotId) -> &mut CacheSlot {
        &mut self.slots[id]
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    pub fn used_count(&self) -> usize {
        self.used.iter().filter(|u| **u).count()
    }

    pub fn used_ids(&self) -> impl Iterator<Item = SlotId> + '_ {
        self.used
            .iter()
            .enumerate()
            .filter_map(|(id, used)| used.then_some(id))
    }

    /// 坐标当前占用的槽位
    /// Slot currently holding the given coordinate
    pub fn slot_at(&self, coord: GridCoord) -> Option<SlotId> {
        self.layout.get(&coord).copied()
    }

    pub fn is_resident(&self, coord: GridCoord) -> bool {
        self.layout.contains_key(&coord)
    }

    /// 取一个空闲槽位; 空闲列表为空时增长一个未初始化槽位
    /// Take a free slot; grows the pool by one uninitialized slot when empty
    pub fn acquire(&mut self) -> SlotId {
        if let Some(id) = self.available.pop() {
            self.used[id] = true;
            return id;
        }
        let id = self.slots.len();
        self.slots.push(CacheSlot {
            id,
            location: UNPLACED,
            data: None,
        });
        self.used.push(true);
        id
    }

    /// 归还槽位并清除其坐标映射. 编号越界会 panic.
    /// Return a slot and drop its coordinate mapping. Panics on out-of-range id.
    pub fn release(&mut self, id: SlotId) {
        assert!(id < self.slots.len(), "released slot id {id} out of range");
        if !self.used[id] {
            warn!("released slot {id} that was already available");
            return;
        }
        let location = self.slots[id].location;
        // 只清除仍指向本槽位的映射 / Only drop the mapping if it still points here
        if self.layout.get(&location) == Some(&id) {
            self.layout.remove(&location);
        }
        self.slots[id].location = UNPLACED;
        self.used[id] = false;
        self.available.push(id);
    }

    /// 释放对每个参考点的 Chebyshev 距离都超过 ringCount + 0.1 的槽位
    /// Release every used slot whose Chebyshev distance to EVERY reference
    /// point exceeds ringCount + 0.1
    ///
    /// Returns the released ids so callers can recycle per-slot payloads.
    pub fn release_beyond_range(&mut self, reference_points: &[GridCoord]) -> Vec<SlotId> {
        if reference_points.is_empty() {
            return Vec::new();
        }
        let limit = self.ring_count as f32 + RING_TOLERANCE;
        let out_of_range: Vec<SlotId> = self
            .used_ids()
            .filter(|&id| {
                let location = self.slots[id].location;
                reference_points
                    .iter()
                    .all(|r| chebyshev(location, *r) as f32 > limit)
            })
            .collect();
        for &id in &out_of_range {
            self.release(id);
        }
        out_of_range
    }

    /// 以第一个参考点为中心, 由内向外逐环分配缺失的网格单元
    /// Allocate missing grid cells ring by ring, expanding outward from the
    /// first reference point
    ///
    /// Stops immediately once the budget predicate fails; remaining cells are
    /// deferred to a later call, never skipped permanently. Returns the work
    /// list, nearest ring first.
    pub fn collect_work(&mut self, reference_points: &[GridCoord]) -> Vec<SlotId> {
        let capacity = self.capacity;
        self.collect_work_with(reference_points, |used| {
            capacity.is_none_or(|cap| used < cap)
        })
    }

    /// 同 collect_work, 使用调用方的预算判定 (参数为当前使用数)
    /// Same as collect_work with a caller-supplied budget predicate
    /// (argument is the current used count)
    pub fn collect_work_with(
        &mut self,
        reference_points: &[GridCoord],
        within_budget: impl FnMut(usize) -> bool,
    ) -> Vec<SlotId> {
        self.collect_work_where(reference_points, None, |_| true, within_budget)
    }

    /// 最通用的收集: 可限制最大环半径, 可按单元过滤
    /// The most general collect: optional radius limit, per-cell admit filter
    ///
    /// A failing budget stops the walk immediately; a rejected cell is merely
    /// skipped and stays eligible for a later call.
    pub fn collect_work_where(
        &mut self,
        reference_points: &[GridCoord],
        max_radius: Option<i32>,
        mut admit: impl FnMut(GridCoord) -> bool,
        mut within_budget: impl FnMut(usize) -> bool,
    ) -> Vec<SlotId> {
        let Some(center) = reference_points.first().copied() else {
            return Vec::new();
        };
        let limit = max_radius.map_or(self.ring_count, |r| r.min(self.ring_count));
        let mut work = Vec::new();
        let mut used = self.used_count();
        for radius in 0..=limit {
            for cell in ring_cells(center, radius) {
                if self.layout.contains_key(&cell) || !admit(cell) {
                    continue;
                }
                if !within_budget(used) {
                    // 预算耗尽: 剩余单元留给下一次调用
                    // Budget exhausted: remaining cells wait for a later call
                    return work;
                }
                let id = self.acquire();
                self.slots[id].location = cell;
                self.layout.insert(cell, id);
                work.push(id);
                used += 1;
            }
        }
        work
    }
}

/// 恰好处于 Chebyshev 距离 r 的所有网格单元
/// All grid cells at exactly Chebyshev distance r
pub fn ring_cells(center: GridCoord, radius: i32) -> Vec<GridCoord> {
    if radius == 0 {
        return vec![center];
    }
    let mut cells = Vec::with_capacity((radius as usize) * 8);
    for x in -radius..=radius {
        cells.push(center + GridCoord::new(x, -radius));
        cells.push(center + GridCoord::new(x, radius));
    }
    for y in (-radius + 1)..radius {
        cells.push(center + GridCoord::new(-radius, y));
        cells.push(center + GridCoord::new(radius, y));
    }
    cells
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_cells_have_exact_chebyshev_distance() {
        let center = GridCoord::new(3, -2);
        for radius in 0..4 {
            let cells = ring_cells(center, radius);
            let expected = if radius == 0 { 1 } else { radius as usize * 8 };
            assert_eq!(cells.len(), expected);
            for cell in cells {
                assert_eq!(chebyshev(cell, center), radius);
            }
        }
    }

    #[test]
    fn collect_work_fills_rings_nearest_first() {
        let mut cache = RingCacheManager::new(2, None);
        let work = cache.collect_work(&[GridCoord::ZERO]);
        assert_eq!(work.len(), 25);
        // 距离沿工作列表单调不减 / Distances are non-decreasing along the work list
        let mut last = 0;
        for id in work {
            let d = chebyshev(cache.slot(id).location, GridCoord::ZERO);
            assert!(d >= last);
            last = d;
        }
    }

    #[test]
    fn collect_work_is_idempotent() {
        let mut cache = RingCacheManager::new(2, None);
        let first = cache.collect_work(&[GridCoord::ZERO]);
        assert!(!first.is_empty());
        let second = cache.collect_work(&[GridCoord::ZERO]);
        assert!(second.is_empty());
    }

    #[test]
    fn collect_work_stops_at_budget_and_resumes() {
        let mut cache = RingCacheManager::new(1, Some(4));
        let first = cache.collect_work(&[GridCoord::ZERO]);
        assert_eq!(first.len(), 4);
        // 同样的预算下重复调用不再产生工作 / No further work under the same budget
        assert!(cache.collect_work(&[GridCoord::ZERO]).is_empty());
        // 释放一个后, 恰好补齐一个缺失单元 / After one release, exactly one cell refills
        let released = first[1];
        cache.release(released);
        let resumed = cache.collect_work(&[GridCoord::ZERO]);
        assert_eq!(resumed.len(), 1);
    }

    #[test]
    fn release_beyond_range_keeps_only_slots_within_rings() {
        let mut cache = RingCacheManager::new(2, None);
        cache.collect_work(&[GridCoord::ZERO]);
        let refs = [GridCoord::new(4, 0)];
        cache.release_beyond_range(&refs);
        for id in cache.used_ids().collect::<Vec<_>>() {
            let location = cache.slot(id).location;
            assert!(chebyshev(location, refs[0]) as f32 <= 2.0 + RING_TOLERANCE);
        }
        // (2,*) 列与 (4,0) 的距离为 2, 保留; 更远的列被释放
        // Column (2,*) is at distance 2 from (4,0) and stays; farther columns go
        assert!(cache.is_resident(GridCoord::new(2, 2)));
        assert!(!cache.is_resident(GridCoord::new(1, 0)));
    }

    #[test]
    fn release_beyond_range_with_no_references_is_a_noop() {
        let mut cache = RingCacheManager::new(1, None);
        cache.collect_work(&[GridCoord::ZERO]);
        let before = cache.used_count();
        cache.release_beyond_range(&[]);
        assert_eq!(cache.used_count(), before);
    }

    #[test]
    fn slot_surviving_any_reference_point_is_kept() {
        let mut cache = RingCacheManager::new(1, None);
        cache.collect_work(&[GridCoord::ZERO]);
        // 第二个参考点覆盖原点周围的单元 / Second reference covers cells near origin
        cache.release_beyond_range(&[GridCoord::new(10, 10), GridCoord::ZERO]);
        assert!(cache.is_resident(GridCoord::ZERO));
    }

    #[test]
    fn released_coordinate_is_immediately_reusable() {
        let mut cache = RingCacheManager::new(2, None);
        cache.collect_work(&[GridCoord::ZERO]);
        cache.release_beyond_range(&[GridCoord::new(10, 0)]);
        assert_eq!(cache.used_count(), 0);
        let work = cache.collect_work(&[GridCoord::new(10, 0)]);
        assert_eq!(work.len(), 25);
        assert!(cache.is_resident(GridCoord::new(10, 0)));
    }

    #[test]
    fn exclusivity_one_slot_per_coordinate() {
        let mut cache = RingCacheManager::new(2, None);
        let work = cache.collect_work(&[GridCoord::ZERO]);
        let mut seen = std::collections::HashSet::new();
        for id in work {
            assert!(seen.insert(cache.slot(id).location));
        }
        // 已用槽位绝不出现在空闲列表 / A used slot never sits in the available list
        for id in cache.used_ids().collect::<Vec<_>>() {
            assert!(!cache.available.contains(&id));
        }
    }

    #[test]
    fn acquire_reuses_released_slots_before_growing() {
        let mut cache = RingCacheManager::new(0, None);
        let a = cache.acquire();
        cache.release(a);
        let b = cache.acquire();
        assert_eq!(a, b);
        assert_eq!(cache.slot_count(), 1);
    }

    #[test]
    #[should_panic]
    fn release_out_of_range_id_panics() {
        let mut cache = RingCacheManager::new(0, None);
        cache.release(3);
    }
}
