//! 骨骼链 - 一组粒子及其约束
//!
//! 设计要点：
//! - 粒子以 Vec 存储，父粒子用索引引用（0 号为根，固定）
//! - 父粒子索引总小于子粒子，积分与写回都按顺序从根到尖
//! - 链之间不共享任何粒子，可以并行模拟
//! - 静止长度在构建时由姿态决定

use glam::{Mat4, Quat, Vec3};

use super::collision::{CollisionSet, CollisionShape, Plane};
use super::config::{ChainSettings, ColliderSelection};
use super::constraint::{
    sort_constraints, AngularLimitConstraint, Constraint, DistanceConstraint,
    LengthLimitConstraint, PinConstraint, PlanarPinConstraint,
};
use super::integrator::{Forces, Integrator};
use super::particle::{Particle, ParticleFlags};
use super::pose_adapter::PoseAdapter;
use super::solver::ConstraintSolver;
use crate::skeleton::BoneSet;
use crate::{Result, VerletError};

/// 重置方式
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResetKind {
    /// 所有粒子随根骨骼平移，速度清零
    Teleport,
    /// 所有粒子回到动画姿态，速度清零
    ResetToPose,
}

/// 链引用的碰撞体
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ChainCollider {
    /// CollisionSet 中的索引
    pub index: usize,
    /// 不参与此碰撞体的粒子
    pub excluded: Vec<usize>,
}

/// 骨骼链
#[derive(Clone, Debug)]
pub struct Chain {
    pub(crate) settings: ChainSettings,
    pub(crate) particles: Vec<Particle>,
    pub(crate) constraints: Vec<Constraint>,
    pub(crate) colliders: Vec<ChainCollider>,
    /// 尚未初始化时，下一帧直接吸附到动画姿态
    pub(crate) initialized: bool,
    /// 写回时复用的位置缓冲区
    pub(crate) written: Vec<Vec3>,
    /// 休眠中只随根骨骼整体移动
    pub(crate) sleeping: bool,
    /// 连续静止的时间（秒）
    pub(crate) still_time: f32,
    /// dt <= 0 时收到的重置，留到下一次模拟
    pub(crate) pending_reset: Option<ResetKind>,
}

impl Chain {
    /// 由粒子与约束直接创建
    ///
    /// 0 号粒子必须固定；粒子的父索引必须小于自身索引。
    pub fn new(particles: Vec<Particle>, constraints: Vec<Constraint>) -> Result<Self> {
        let settings = ChainSettings {
            name: "chain".to_string(),
            ..Default::default()
        };
        Self::validate_parts(&settings.name, &particles, &constraints)?;
        Ok(Self {
            settings,
            particles,
            constraints,
            colliders: Vec::new(),
            initialized: true,
            written: Vec::new(),
            sleeping: false,
            still_time: 0.0,
            pending_reset: None,
        })
    }

    /// 按位置创建一条直链：根固定，相邻粒子之间加刚度 1 的距离约束
    pub fn from_positions(positions: &[Vec3]) -> Result<Self> {
        let mut particles: Vec<Particle> = positions
            .iter()
            .enumerate()
            .map(|(i, &position)| match i {
                0 => Particle::fixed(position),
                _ => Particle::new(position, 1.0).with_parent(i - 1),
            })
            .collect();
        if let Some(tip) = particles.last_mut() {
            tip.flags.insert(ParticleFlags::TIP);
        }
        let constraints = (1..particles.len())
            .map(|i| Constraint::Distance(DistanceConstraint::from_particles(i - 1, i, &particles, 1.0)))
            .collect();
        Self::new(particles, constraints)
    }

    /// 按配置从骨骼层次构建
    ///
    /// `pose` 为构建时的世界姿态（决定静止长度），通常是参考姿态。
    pub fn build(
        settings: &ChainSettings,
        bones: &BoneSet,
        pose: &[Mat4],
        colliders: &CollisionSet,
    ) -> Result<Self> {
        settings.validate()?;
        bones.check_pose_len(pose.len())?;

        let bone_indices = settings
            .bones
            .iter()
            .map(|name| bones.bone_index(name))
            .collect::<Result<Vec<_>>>()?;
        for pair in bone_indices.windows(2) {
            if !bones.is_ancestor(pair[0], pair[1]) {
                return Err(VerletError::ChainNotConnected {
                    chain: settings.name.clone(),
                    parent: bones.bones()[pair[0]].name.clone(),
                    child: bones.bones()[pair[1]].name.clone(),
                });
            }
        }

        let has_virtual_tip = settings.virtual_tip_length > 0.0;
        let count = bone_indices.len() + usize::from(has_virtual_tip);
        if count < 2 {
            return Err(VerletError::ChainTooShort {
                chain: settings.name.clone(),
                count,
            });
        }

        // ========================================
        // 粒子
        // ========================================
        let mut particles = Vec::with_capacity(count);
        for (i, &bone) in bone_indices.iter().enumerate() {
            let particle = match i {
                0 => Particle::fixed(Vec3::ZERO),
                _ => Particle::new(Vec3::ZERO, settings.mass).with_parent(i - 1),
            };
            particles.push(particle.with_bone(bone).with_radius(settings.particle_radius));
        }
        if has_virtual_tip {
            let mut tip = Particle::new(Vec3::ZERO, settings.mass)
                .with_parent(count - 2)
                .with_radius(settings.particle_radius);
            tip.flags.insert(ParticleFlags::VIRTUAL);
            particles.push(tip);
        }
        particles[count - 1].flags.insert(ParticleFlags::TIP);

        let mut chain = Self {
            settings: settings.clone(),
            particles,
            constraints: Vec::new(),
            colliders: Vec::new(),
            initialized: false,
            written: Vec::with_capacity(count),
            sleeping: false,
            still_time: 0.0,
            pending_reset: None,
        };
        PoseAdapter::read(&mut chain, pose);
        chain.reset_to_pose();
        chain.initialized = false;

        // ========================================
        // 约束
        // ========================================
        let mut constraints = Vec::new();
        for i in 1..count {
            let rest_length = chain.particles[i - 1]
                .pose_position
                .distance(chain.particles[i].pose_position);
            constraints.push(Constraint::Distance(DistanceConstraint::new(
                i - 1,
                i,
                rest_length,
                settings.stiffness,
            )));
            if let Some(angle) = settings.cone_angle_degrees {
                constraints.push(Constraint::AngularLimit(AngularLimitConstraint::new(
                    i - 1,
                    i,
                    angle,
                    settings.cone_reference,
                )));
            }
            if let Some(margin) = settings.length_margin {
                constraints.push(Constraint::LengthLimit(LengthLimitConstraint::new(
                    i - 1,
                    i,
                    rest_length,
                    margin,
                )));
            }
        }
        for pin in &settings.planar_pins {
            let particle = chain
                .particle_for_bone(bones, &pin.bone)
                .ok_or_else(|| VerletError::BoneNotFound(pin.bone.clone()))?;
            constraints.push(Constraint::PlanarPin(PlanarPinConstraint::new(
                particle,
                Plane::new(pin.point, pin.normal),
            )));
        }
        if let Some(margin) = settings.lock_tip {
            constraints.push(Constraint::Pin(PinConstraint::new(count - 1, margin)));
        }
        sort_constraints(&mut constraints, settings.constraint_order);
        Self::validate_parts(&settings.name, &chain.particles, &constraints)?;
        chain.constraints = constraints;

        // ========================================
        // 碰撞体
        // ========================================
        let selected: Vec<usize> = match &settings.colliders {
            ColliderSelection::All => (0..colliders.len()).collect(),
            ColliderSelection::Named(names) => names
                .iter()
                .map(|name| {
                    colliders.find(name).ok_or_else(|| VerletError::InvalidSetting {
                        name: "colliders",
                        reason: format!("chain '{}' selects unknown collider '{}'", settings.name, name),
                    })
                })
                .collect::<Result<_>>()?,
            ColliderSelection::None => Vec::new(),
        };
        for index in selected {
            let Some(primitive) = colliders.get(index) else {
                continue;
            };
            let excluded = primitive
                .excluded_bones
                .iter()
                .filter_map(|name| chain.particle_for_bone(bones, name))
                .collect();
            chain.colliders.push(ChainCollider { index, excluded });
        }

        Ok(chain)
    }

    fn validate_parts(name: &str, particles: &[Particle], constraints: &[Constraint]) -> Result<()> {
        if particles.len() < 2 {
            return Err(VerletError::ChainTooShort {
                chain: name.to_string(),
                count: particles.len(),
            });
        }
        if !particles[0].is_fixed() || particles[0].inverse_mass != 0.0 {
            return Err(VerletError::InvalidSetting {
                name: "particles",
                reason: format!("root particle of chain '{name}' must be fixed"),
            });
        }
        for (i, particle) in particles.iter().enumerate() {
            if matches!(particle.parent, Some(parent) if parent >= i) {
                return Err(VerletError::InvalidSetting {
                    name: "particles",
                    reason: format!("particle {i} of chain '{name}' has a parent after it"),
                });
            }
        }
        for constraint in constraints {
            constraint.validate(particles.len())?;
        }
        Ok(())
    }

    // ========================================
    // 访问器
    // ========================================

    #[inline]
    pub fn name(&self) -> &str {
        &self.settings.name
    }

    #[inline]
    pub fn settings(&self) -> &ChainSettings {
        &self.settings
    }

    /// 修改运行时参数（不会重建粒子与约束）
    #[inline]
    pub fn settings_mut(&mut self) -> &mut ChainSettings {
        &mut self.settings
    }

    #[inline]
    pub fn particles(&self) -> &[Particle] {
        &self.particles
    }

    #[inline]
    pub fn particles_mut(&mut self) -> &mut [Particle] {
        &mut self.particles
    }

    #[inline]
    pub fn constraints(&self) -> &[Constraint] {
        &self.constraints
    }

    #[inline]
    pub fn colliders(&self) -> &[ChainCollider] {
        &self.colliders
    }

    #[inline]
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    #[inline]
    pub fn is_sleeping(&self) -> bool {
        self.sleeping
    }

    /// 尚未执行的重置
    #[inline]
    pub fn pending_reset(&self) -> Option<ResetKind> {
        self.pending_reset
    }

    /// 按骨骼名称查找粒子索引
    pub fn particle_for_bone(&self, bones: &BoneSet, name: &str) -> Option<usize> {
        let bone = bones.find_bone(name)?;
        self.particles.iter().position(|p| p.bone_index == Some(bone))
    }

    /// 链驱动的骨骼索引
    pub fn bone_indices(&self) -> impl Iterator<Item = usize> + '_ {
        self.particles.iter().filter_map(|p| p.bone_index)
    }

    // ========================================
    // 模拟
    // ========================================

    /// 下一帧重新吸附到动画姿态
    pub fn mark_uninitialized(&mut self) {
        self.initialized = false;
    }

    /// 记下重置请求，在下一次 dt > 0 的模拟中执行（ResetToPose 优先于 Teleport）
    pub fn request_reset(&mut self, reset: ResetKind) {
        self.pending_reset = merge_reset(self.pending_reset, Some(reset));
    }

    /// 所有粒子回到动画姿态，速度清零
    pub fn reset_to_pose(&mut self) {
        for particle in &mut self.particles {
            particle.reset_to_pose();
        }
        self.initialized = true;
        self.wake_up();
    }

    fn wake_up(&mut self) {
        self.sleeping = false;
        self.still_time = 0.0;
    }

    /// 所有粒子随根骨骼平移到新位置，速度清零
    pub fn teleport(&mut self) {
        let offset = self.particles[0].pose_position - self.particles[0].position;
        for particle in &mut self.particles {
            particle.translate(offset);
            particle.zero_velocity();
            particle.prev_pose_position = particle.pose_position;
            particle.prev_pose_rotation = particle.pose_rotation;
        }
        self.particles[0].position = self.particles[0].pose_position;
        self.wake_up();
    }

    /// 自由粒子绕根粒子旋转 rotation 后平移 translation（位置与历史一起，不改变隐式速度）
    fn carry_with_root(&mut self, rotation: Quat, translation: Vec3) {
        if rotation == Quat::IDENTITY && translation == Vec3::ZERO {
            return;
        }
        let pivot = self.particles[0].position;
        for particle in self.particles.iter_mut().filter(|p| !p.is_fixed()) {
            particle.position = pivot + rotation * (particle.position - pivot) + translation;
            particle.previous_position = pivot + rotation * (particle.previous_position - pivot) + translation;
        }
    }

    /// 根骨骼本帧的旋转变化（世界空间，角度在 [0, π]）
    fn root_rotation_delta(&self) -> Quat {
        let root = &self.particles[0];
        let delta = (root.pose_rotation * root.prev_pose_rotation.inverse()).normalize();
        if delta.w < 0.0 {
            -delta
        } else {
            delta
        }
    }

    /// 根骨骼移动、旋转时按惯性设置带动自由粒子
    ///
    /// 惯性比例为 scale 时随根运动 (1 - scale)；超过上限的部分总是随根运动。
    fn apply_root_inertia(&mut self, root_delta: Vec3) {
        let scale = self.settings.move_inertia_scale;
        let mut carry = root_delta * (1.0 - scale);
        if let Some(clamp) = self.settings.move_inertia_clamp {
            let distance = root_delta.length();
            if distance > clamp {
                carry += root_delta * ((distance - clamp) / distance) * scale;
            }
        }

        let (axis, angle) = self.root_rotation_delta().to_axis_angle();
        let scale = self.settings.rotation_inertia_scale;
        let mut carry_angle = angle * (1.0 - scale);
        if let Some(clamp) = self.settings.rotation_inertia_clamp_degrees {
            carry_angle += (angle - clamp.to_radians()).max(0.0) * scale;
        }
        let rotation = if carry_angle.abs() > f32::EPSILON {
            Quat::from_axis_angle(axis, carry_angle)
        } else {
            Quat::IDENTITY
        };

        self.carry_with_root(rotation, carry);
    }

    /// 休眠中是否有动画姿态变化足以唤醒
    fn pose_moved(&self, threshold: f32) -> bool {
        self.particles
            .iter()
            .any(|p| p.pose_position.distance(p.prev_pose_position) > threshold)
    }

    /// 模拟后更新静止时间，达到阈值时进入休眠
    fn update_sleep(&mut self, dt: f32) {
        let threshold = self.settings.sleep_delta_threshold;
        let still = !self.pose_moved(threshold)
            && self
                .particles
                .iter()
                .filter(|p| !p.is_fixed())
                .all(|p| p.implicit_velocity().length() <= threshold);
        if !still {
            self.still_time = 0.0;
            return;
        }
        self.still_time += dt;
        if self.still_time >= self.settings.sleep_trigger_duration {
            for particle in self.particles.iter_mut().filter(|p| !p.is_fixed()) {
                particle.position = particle.previous_position;
            }
            self.sleeping = true;
            self.still_time = 0.0;
            log::debug!("[AnimVerlet] 链 '{}' 进入休眠", self.settings.name);
        }
    }

    /// 模拟一帧（动画姿态需已由 PoseAdapter::read 读入）
    ///
    /// 返回是否进行了模拟。dt <= 0 时跳过，收到的重置留到下一帧；
    /// 未初始化或 ResetToPose 时只吸附到姿态；休眠中只随根骨骼整体移动。
    pub fn simulate(
        &mut self,
        delta_time: f32,
        forces: &Forces,
        reset: Option<ResetKind>,
        world_shapes: &[Option<CollisionShape>],
    ) -> bool {
        let dt = self.settings.effective_delta_time(delta_time);
        if !(dt > 0.0) {
            if let Some(reset) = reset {
                self.request_reset(reset);
            }
            return false;
        }
        let reset = merge_reset(reset, self.pending_reset.take());

        if !self.initialized || reset == Some(ResetKind::ResetToPose) {
            self.reset_to_pose();
            log::debug!("[AnimVerlet] 链 '{}' 重置到动画姿态", self.settings.name);
            return false;
        }

        let root_delta = self.particles[0].pose_position - self.particles[0].position;
        let auto_teleport = self
            .settings
            .teleport_distance
            .is_some_and(|limit| root_delta.length() > limit);
        if reset == Some(ResetKind::Teleport) || auto_teleport {
            self.teleport();
            log::debug!(
                "[AnimVerlet] 链 '{}' 传送: 根骨骼位移 {:.3}",
                self.settings.name,
                root_delta.length()
            );
        } else if self.sleeping {
            if !self.settings.use_sleep || self.pose_moved(self.settings.wake_up_delta_threshold) {
                self.wake_up();
                log::debug!("[AnimVerlet] 链 '{}' 唤醒", self.settings.name);
                self.apply_root_inertia(root_delta);
            } else {
                let rotation = self.root_rotation_delta();
                self.carry_with_root(rotation, root_delta);
                self.particles[0].position = self.particles[0].pose_position;
                self.particles[0].previous_position = self.particles[0].pose_position;
                return false;
            }
        } else {
            self.apply_root_inertia(root_delta);
        }

        Integrator::from_settings(&self.settings).step(&mut self.particles, dt, forces);
        ConstraintSolver::new(self.settings.solver_iterations).solve(self, world_shapes);
        if self.settings.use_sleep {
            self.update_sleep(dt);
        }
        true
    }
}

/// 合并两个重置请求，ResetToPose 优先
fn merge_reset(a: Option<ResetKind>, b: Option<ResetKind>) -> Option<ResetKind> {
    match (a, b) {
        (Some(ResetKind::ResetToPose), _) | (_, Some(ResetKind::ResetToPose)) => Some(ResetKind::ResetToPose),
        (Some(kind), _) | (None, Some(kind)) => Some(kind),
        (None, None) => None,
    }
}
