//! 物理系统 - Verlet 骨骼链模拟
//!
//! 核心设计思想：
//! - Particle: 质点，inverse_mass 为 0 表示固定
//! - Constraint: 封闭枚举（距离 / 角度 / 平面钉住 / 长度限制 / 钉住）
//! - CollisionShape: 球 / 胶囊 / 平面 / 盒子，纯位置投影
//! - Chain: 一条链的粒子、约束与碰撞体引用
//! - Integrator + ConstraintSolver: 积分与迭代求解
//! - PoseAdapter: 动画姿态 ↔ 粒子
//! - VerletPhysics: 每个实例的驱动器

mod chain;
mod collision;
pub mod config;
mod constraint;
mod integrator;
mod particle;
mod pose_adapter;
mod solver;
mod verlet_physics;

pub use chain::{Chain, ChainCollider, ResetKind};
pub use collision::{CollisionPrimitive, CollisionSet, CollisionShape, Plane};
pub use config::{
    ChainSettings, ColliderSelection, ConeReference, ConstraintOrder, PlanarPinSettings,
    SimulationPreset,
};
pub use constraint::{
    AngularLimitConstraint, Constraint, DistanceConstraint, LengthLimitConstraint, PinConstraint,
    PlanarPinConstraint,
};
pub use integrator::{Forces, Integrator, WindField, DEFAULT_GRAVITY};
pub use particle::{Particle, ParticleFlags};
pub use pose_adapter::PoseAdapter;
pub use solver::ConstraintSolver;
pub use verlet_physics::{TickInput, VerletPhysics};
