//! 约束 - 封闭的枚举，每种约束一个 solve
//!
//! 所有约束只操作同一条链内的粒子（按索引引用）。
//! 数值退化（重合粒子、零长度方向）时跳过本次修正，不报错。

use std::f32::consts::PI;

use glam::{Quat, Vec3};

use super::collision::Plane;
use super::config::{ConeReference, ConstraintOrder};
use super::particle::Particle;
use crate::{Result, VerletError};

/// 长度低于此值视为退化
pub(crate) const DEGENERATE_LENGTH: f32 = 1e-6;

// ============================================================================
// 约束枚举
// ============================================================================

/// 约束
#[derive(Clone, Debug, PartialEq)]
pub enum Constraint {
    Distance(DistanceConstraint),
    AngularLimit(AngularLimitConstraint),
    PlanarPin(PlanarPinConstraint),
    LengthLimit(LengthLimitConstraint),
    Pin(PinConstraint),
}

impl Constraint {
    /// 投影修正
    #[inline]
    pub fn solve(&self, particles: &mut [Particle]) {
        match self {
            Constraint::Distance(c) => c.solve(particles),
            Constraint::AngularLimit(c) => c.solve(particles),
            Constraint::PlanarPin(c) => c.solve(particles),
            Constraint::LengthLimit(c) => c.solve(particles),
            Constraint::Pin(c) => c.solve(particles),
        }
    }

    /// 校验索引与参数
    pub fn validate(&self, particle_count: usize) -> Result<()> {
        match self {
            Constraint::Distance(c) => {
                check_pair(c.a, c.b, particle_count, "distance")?;
                check_non_negative(c.rest_length, "distance rest length")?;
                if !(0.0..=1.0).contains(&c.stiffness) {
                    return Err(VerletError::InvalidConstraint(format!(
                        "distance stiffness {} is outside [0, 1]",
                        c.stiffness
                    )));
                }
                Ok(())
            }
            Constraint::AngularLimit(c) => {
                check_pair(c.parent, c.child, particle_count, "angular limit")?;
                if !(0.0..=PI).contains(&c.max_angle) {
                    return Err(VerletError::InvalidConstraint(format!(
                        "angular limit {} degrees is outside [0, 180]",
                        c.max_angle.to_degrees()
                    )));
                }
                Ok(())
            }
            Constraint::PlanarPin(c) => {
                check_index(c.particle, particle_count, "planar pin")?;
                if !c.plane.normal.is_normalized() {
                    return Err(VerletError::InvalidConstraint(
                        "planar pin normal is not normalized".to_string(),
                    ));
                }
                Ok(())
            }
            Constraint::LengthLimit(c) => {
                check_pair(c.a, c.b, particle_count, "length limit")?;
                check_non_negative(c.rest_length, "length limit rest length")?;
                check_non_negative(c.margin, "length limit margin")
            }
            Constraint::Pin(c) => {
                check_index(c.particle, particle_count, "pin")?;
                check_non_negative(c.margin, "pin margin")
            }
        }
    }

    /// 约束所在链接（涉及的最大粒子索引，离根越远越大）
    pub fn link(&self) -> usize {
        match self {
            Constraint::Distance(c) => c.a.max(c.b),
            Constraint::AngularLimit(c) => c.parent.max(c.child),
            Constraint::PlanarPin(c) => c.particle,
            Constraint::LengthLimit(c) => c.a.max(c.b),
            Constraint::Pin(c) => c.particle,
        }
    }

    /// 同一链接内 / 同一组内的求解先后
    pub fn kind_rank(&self, order: ConstraintOrder) -> u8 {
        match (order, self) {
            (_, Constraint::Distance(_)) => 0,
            (_, Constraint::AngularLimit(_)) => 1,
            (ConstraintOrder::ChainOrder, Constraint::LengthLimit(_)) => 2,
            (ConstraintOrder::ChainOrder, Constraint::PlanarPin(_)) => 3,
            (ConstraintOrder::ByKind, Constraint::PlanarPin(_)) => 2,
            (ConstraintOrder::ByKind, Constraint::LengthLimit(_)) => 3,
            (_, Constraint::Pin(_)) => 4,
        }
    }
}

/// 按求解策略排序（稳定排序，同键保持插入顺序）
pub fn sort_constraints(constraints: &mut [Constraint], order: ConstraintOrder) {
    match order {
        ConstraintOrder::ChainOrder => {
            constraints.sort_by_key(|c| (c.link(), c.kind_rank(order)));
        }
        ConstraintOrder::ByKind => {
            constraints.sort_by_key(|c| (c.kind_rank(order), c.link()));
        }
    }
}

fn check_index(idx: usize, count: usize, what: &str) -> Result<()> {
    if idx >= count {
        return Err(VerletError::InvalidConstraint(format!(
            "{what} references particle {idx}, chain has {count}"
        )));
    }
    Ok(())
}

fn check_pair(a: usize, b: usize, count: usize, what: &str) -> Result<()> {
    check_index(a, count, what)?;
    check_index(b, count, what)?;
    if a == b {
        return Err(VerletError::InvalidConstraint(format!(
            "{what} references particle {a} twice"
        )));
    }
    Ok(())
}

fn check_non_negative(value: f32, what: &str) -> Result<()> {
    if !(value >= 0.0 && value.is_finite()) {
        return Err(VerletError::InvalidConstraint(format!(
            "{what} must be a non-negative number, got {value}"
        )));
    }
    Ok(())
}

// ============================================================================
// 距离约束
// ============================================================================

/// 距离约束：按 inverse_mass 分配修正
#[derive(Clone, Debug, PartialEq)]
pub struct DistanceConstraint {
    pub a: usize,
    pub b: usize,
    pub rest_length: f32,
    pub stiffness: f32,
}

impl DistanceConstraint {
    pub fn new(a: usize, b: usize, rest_length: f32, stiffness: f32) -> Self {
        Self {
            a,
            b,
            rest_length,
            stiffness,
        }
    }

    /// 以当前距离作为静止长度
    pub fn from_particles(a: usize, b: usize, particles: &[Particle], stiffness: f32) -> Self {
        let rest_length = particles[a].position.distance(particles[b].position);
        Self::new(a, b, rest_length, stiffness)
    }

    pub fn solve(&self, particles: &mut [Particle]) {
        let delta = particles[self.b].position - particles[self.a].position;
        let distance = delta.length();
        if distance < DEGENERATE_LENGTH {
            return;
        }

        let wa = particles[self.a].inverse_mass;
        let wb = particles[self.b].inverse_mass;
        let w = wa + wb;
        if w <= 0.0 {
            return;
        }

        let correction = delta * ((distance - self.rest_length) / distance) * self.stiffness;
        particles[self.a].position += correction * (wa / w);
        particles[self.b].position -= correction * (wb / w);
    }
}

// ============================================================================
// 角度约束（锥形限制）
// ============================================================================

/// 角度约束：子粒子绕父粒子旋转回锥面，保持到父粒子的距离
#[derive(Clone, Debug, PartialEq)]
pub struct AngularLimitConstraint {
    pub parent: usize,
    pub child: usize,
    /// 最大偏离角（弧度）
    pub max_angle: f32,
    pub reference: ConeReference,
}

impl AngularLimitConstraint {
    pub fn new(parent: usize, child: usize, max_angle_degrees: f32, reference: ConeReference) -> Self {
        Self {
            parent,
            child,
            max_angle: max_angle_degrees.to_radians(),
            reference,
        }
    }

    /// 锥轴方向（单位向量），退化时返回 None
    pub fn reference_direction(&self, particles: &[Particle]) -> Option<Vec3> {
        let parent = &particles[self.parent];
        let child = &particles[self.child];
        let pose_dir = (child.pose_position - parent.pose_position).normalize_or_zero();
        if pose_dir == Vec3::ZERO {
            return None;
        }

        match (self.reference, parent.parent) {
            (ConeReference::ParentDirection, Some(grand)) => {
                let grand = &particles[grand];
                let pose_parent_dir = (parent.pose_position - grand.pose_position).normalize_or_zero();
                let sim_parent_dir = (parent.position - grand.position).normalize_or_zero();
                if pose_parent_dir == Vec3::ZERO || sim_parent_dir == Vec3::ZERO {
                    return Some(pose_dir);
                }
                // 静止方向随父骨骼当前朝向一起转动
                let swing = Quat::from_rotation_arc(pose_parent_dir, sim_parent_dir);
                Some((swing * pose_dir).normalize())
            }
            _ => Some(pose_dir),
        }
    }

    pub fn solve(&self, particles: &mut [Particle]) {
        if particles[self.child].inverse_mass <= 0.0 {
            return;
        }
        let Some(axis_dir) = self.reference_direction(particles) else {
            return;
        };

        let parent_pos = particles[self.parent].position;
        let offset = particles[self.child].position - parent_pos;
        let length = offset.length();
        if length < DEGENERATE_LENGTH {
            return;
        }
        let dir = offset / length;

        let angle = dir.dot(axis_dir).clamp(-1.0, 1.0).acos();
        if angle <= self.max_angle {
            return;
        }

        let rotate_axis = axis_dir.cross(dir);
        let rotate_axis = if rotate_axis.length_squared() < DEGENERATE_LENGTH * DEGENERATE_LENGTH {
            // 与锥轴反向，任取垂直轴
            axis_dir.any_orthonormal_vector()
        } else {
            rotate_axis.normalize()
        };

        let limited = Quat::from_axis_angle(rotate_axis, self.max_angle) * axis_dir;
        particles[self.child].position = parent_pos + limited * length;
    }
}

// ============================================================================
// 平面钉住
// ============================================================================

/// 平面钉住：粒子只能位于平面法线一侧
#[derive(Clone, Debug, PartialEq)]
pub struct PlanarPinConstraint {
    pub particle: usize,
    pub plane: Plane,
}

impl PlanarPinConstraint {
    pub fn new(particle: usize, plane: Plane) -> Self {
        Self { particle, plane }
    }

    pub fn solve(&self, particles: &mut [Particle]) {
        let p = &mut particles[self.particle];
        if p.inverse_mass <= 0.0 {
            return;
        }
        let dist = self.plane.signed_distance(p.position);
        if dist < 0.0 {
            p.position -= self.plane.normal * dist;
        }
    }
}

// ============================================================================
// 长度硬限制
// ============================================================================

/// 长度硬限制：把距离夹到 [L - margin, L + margin]
///
/// 只移动可动的一侧（优先 b），迭代次数少时也能保持骨骼长度。
#[derive(Clone, Debug, PartialEq)]
pub struct LengthLimitConstraint {
    pub a: usize,
    pub b: usize,
    pub rest_length: f32,
    pub margin: f32,
}

impl LengthLimitConstraint {
    pub fn new(a: usize, b: usize, rest_length: f32, margin: f32) -> Self {
        Self {
            a,
            b,
            rest_length,
            margin,
        }
    }

    pub fn solve(&self, particles: &mut [Particle]) {
        let delta = particles[self.b].position - particles[self.a].position;
        let distance = delta.length();
        if distance < DEGENERATE_LENGTH {
            return;
        }

        let max_length = self.rest_length + self.margin;
        let min_length = (self.rest_length - self.margin).max(0.0);
        let target = if distance > max_length {
            max_length
        } else if distance < min_length {
            min_length
        } else {
            return;
        };

        let dir = delta / distance;
        if particles[self.b].inverse_mass > 0.0 {
            particles[self.b].position = particles[self.a].position + dir * target;
        } else if particles[self.a].inverse_mass > 0.0 {
            particles[self.a].position = particles[self.b].position - dir * target;
        }
    }
}

// ============================================================================
// 钉住
// ============================================================================

/// 钉住：粒子与动画姿态位置的偏移不超过 margin
#[derive(Clone, Debug, PartialEq)]
pub struct PinConstraint {
    pub particle: usize,
    pub margin: f32,
}

impl PinConstraint {
    pub fn new(particle: usize, margin: f32) -> Self {
        Self { particle, margin }
    }

    pub fn solve(&self, particles: &mut [Particle]) {
        let p = &mut particles[self.particle];
        let offset = p.position - p.pose_position;
        let distance = offset.length();
        if distance <= self.margin {
            return;
        }
        p.position = p.pose_position + offset * (self.margin / distance);
    }
}
