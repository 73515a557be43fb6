pub use crate::{
    BevyClipmapTerrainPlugins,
    clipmap::{
        ClipmapLevel, ClipmapLevelSet, DataLayerDesc, SectionChoice, StitchConfig,
        TerrainRebuildError,
    },
    collision::{CollisionMesh, CollisionTile, CollisionTilePool, CollisionTileState},
    components::*,
    generator::{
        BrushPass, BrushRedrawRequests, GeneratorDrawQueue, GeneratorDrawRequest,
        GeneratorMaterial, GeneratorParams, GeneratorPass, GeneratorSeeds, RenderFence,
    },
    orchestrator::{
        ClipmapPlugin, CollisionTilePlugin, ReadbackPlugin, SpawnablePlugin, TerrainGenerator,
        TerrainLayerConfig, TerrainPoolSet, TerrainTickState,
    },
    readback::{ReadbackBufferPool, ReadbackHandle, ReadbackQueue, ReadbackRequest, SpawnRecord},
    ring_cache::{GridCoord, RingCacheManager, SlotId},
    scheduler::{ClipmapScheduler, FenceQueue, SegmentedComputeState, TextureCopyQueue},
    settings::{ClipmapTerrainSettings, CollisionSettings, TerrainBudgets},
    spawnable::{
        CollisionInstanceRef, CullDistance, InstanceTransform, InstancedMeshComponent,
        ProximityPool, SpawnElementState, SpawnableDefinition, SpawnableKind, SpawnablePool,
        SpawnablePools, SpawnableTileElement, SpawnableVariety, ViewCone,
    },
    texture_cache::{TextureCacheGroup, TextureCacheGroups, TextureKindDesc},
};
