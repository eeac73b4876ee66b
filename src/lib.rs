//! AnimVerlet 运行时
//!
//! 骨骼链的二次运动模拟（头发、尾巴、披风、挂件）。
//! 每帧流程：读取动画姿态 → Verlet 积分 → 约束迭代 → 写回骨骼变换。
//!
//! 模块划分：
//! - skeleton: 骨骼层次结构（由宿主提供）
//! - physics: 粒子、约束、碰撞体、链、积分器、求解器、姿态适配器与驱动器

pub mod physics;
pub mod skeleton;

pub use physics::{
    Chain, ChainSettings, CollisionPrimitive, CollisionSet, CollisionShape, Constraint,
    ConstraintSolver, Integrator, Particle, PoseAdapter, ResetKind, TickInput, VerletPhysics,
    WindField,
};
pub use skeleton::{BoneLink, BoneSet, BoneTransform};

use thiserror::Error;

/// AnimVerlet 错误类型
#[derive(Debug, Error)]
pub enum VerletError {
    #[error("Bone '{0}' not found in skeleton")]
    BoneNotFound(String),

    #[error("Duplicate bone name '{0}' in skeleton")]
    DuplicateBone(String),

    #[error("Chain '{chain}' needs at least 2 particles, got {count}")]
    ChainTooShort { chain: String, count: usize },

    #[error("Chain '{chain}': bone '{child}' is not a descendant of '{parent}'")]
    ChainNotConnected {
        chain: String,
        parent: String,
        child: String,
    },

    #[error("Negative radius {radius} on '{owner}'")]
    NegativeRadius { owner: String, radius: f32 },

    #[error("Invalid setting '{name}': {reason}")]
    InvalidSetting { name: &'static str, reason: String },

    #[error("Invalid constraint: {0}")]
    InvalidConstraint(String),

    #[error("Pose has {actual} transforms, skeleton has {expected} bones")]
    PoseSizeMismatch { expected: usize, actual: usize },
}

/// Result 类型别名
pub type Result<T> = std::result::Result<T, VerletError>;
