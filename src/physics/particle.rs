//! 粒子 - 单根模拟骨骼的质点
//!
//! Verlet 不保存显式速度，速度由 position - previous_position 隐式给出。
//! 固定粒子的 inverse_mass 为 0，约束计算时自然不承担任何修正。

use bitflags::bitflags;
use glam::{Quat, Vec3};

bitflags! {
    /// 粒子标志位
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct ParticleFlags: u32 {
        /// 固定（每帧直接跟随动画姿态）
        const FIXED = 1 << 0;
        /// 虚拟粒子（没有对应骨骼，不写回）
        const VIRTUAL = 1 << 1;
        /// 链末端
        const TIP = 1 << 2;
    }
}

/// 粒子
#[derive(Clone, Debug)]
pub struct Particle {
    // ========================================
    // 静态数据
    // ========================================
    /// 驱动的骨骼索引（虚拟粒子为 None）
    pub bone_index: Option<usize>,
    /// 父粒子索引（根粒子为 None）
    pub parent: Option<usize>,
    pub flags: ParticleFlags,
    pub mass: f32,
    pub inverse_mass: f32,
    /// 碰撞半径
    pub radius: f32,

    // ========================================
    // 模拟状态
    // ========================================
    pub position: Vec3,
    pub previous_position: Vec3,

    // ========================================
    // 动画姿态（每帧由 PoseAdapter 读入）
    // ========================================
    pub pose_position: Vec3,
    pub prev_pose_position: Vec3,
    pub pose_rotation: Quat,
    pub prev_pose_rotation: Quat,
    pub pose_scale: Vec3,

    /// 写回用的旋转结果
    pub rotation: Quat,
}

impl Particle {
    /// 创建自由粒子
    pub fn new(position: Vec3, mass: f32) -> Self {
        let inverse_mass = if mass > 0.0 { 1.0 / mass } else { 0.0 };
        let mut flags = ParticleFlags::empty();
        if inverse_mass == 0.0 {
            flags.insert(ParticleFlags::FIXED);
        }
        Self {
            bone_index: None,
            parent: None,
            flags,
            mass,
            inverse_mass,
            radius: 0.0,
            position,
            previous_position: position,
            pose_position: position,
            prev_pose_position: position,
            pose_rotation: Quat::IDENTITY,
            prev_pose_rotation: Quat::IDENTITY,
            pose_scale: Vec3::ONE,
            rotation: Quat::IDENTITY,
        }
    }

    /// 创建固定粒子
    pub fn fixed(position: Vec3) -> Self {
        let mut particle = Self::new(position, 0.0);
        particle.set_fixed(true);
        particle
    }

    pub fn with_parent(mut self, parent: usize) -> Self {
        self.parent = Some(parent);
        self
    }

    pub fn with_bone(mut self, bone_index: usize) -> Self {
        self.bone_index = Some(bone_index);
        self
    }

    pub fn with_radius(mut self, radius: f32) -> Self {
        self.radius = radius;
        self
    }

    // ========================================
    // 标志
    // ========================================

    #[inline]
    pub fn is_fixed(&self) -> bool {
        self.flags.contains(ParticleFlags::FIXED)
    }

    #[inline]
    pub fn is_virtual(&self) -> bool {
        self.flags.contains(ParticleFlags::VIRTUAL)
    }

    #[inline]
    pub fn is_tip(&self) -> bool {
        self.flags.contains(ParticleFlags::TIP)
    }

    /// 固定粒子的 inverse_mass 总为 0
    pub fn set_fixed(&mut self, fixed: bool) {
        if fixed {
            self.flags.insert(ParticleFlags::FIXED);
            self.inverse_mass = 0.0;
        } else {
            self.flags.remove(ParticleFlags::FIXED);
            self.inverse_mass = if self.mass > 0.0 { 1.0 / self.mass } else { 0.0 };
        }
    }

    // ========================================
    // 状态
    // ========================================

    /// 隐式速度（每帧位移）
    #[inline]
    pub fn implicit_velocity(&self) -> Vec3 {
        self.position - self.previous_position
    }

    /// 清零隐式速度
    #[inline]
    pub fn zero_velocity(&mut self) {
        self.previous_position = self.position;
    }

    /// 位置与历史同时平移，不改变隐式速度
    #[inline]
    pub fn translate(&mut self, offset: Vec3) {
        self.position += offset;
        self.previous_position += offset;
    }

    /// 读入本帧动画姿态
    #[inline]
    pub fn set_pose(&mut self, position: Vec3, rotation: Quat, scale: Vec3) {
        self.prev_pose_position = self.pose_position;
        self.prev_pose_rotation = self.pose_rotation;
        self.pose_position = position;
        self.pose_rotation = rotation;
        self.pose_scale = scale;
    }

    /// 回到动画姿态，无速度
    pub fn reset_to_pose(&mut self) {
        self.position = self.pose_position;
        self.previous_position = self.pose_position;
        self.prev_pose_position = self.pose_position;
        self.prev_pose_rotation = self.pose_rotation;
        self.rotation = self.pose_rotation;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_particle_has_no_inverse_mass() {
        let root = Particle::fixed(Vec3::ZERO);
        assert!(root.is_fixed());
        assert_eq!(root.inverse_mass, 0.0);

        let mut free = Particle::new(Vec3::ONE, 2.0);
        assert!(!free.is_fixed());
        assert!((free.inverse_mass - 0.5).abs() < 1e-6);

        free.set_fixed(true);
        assert_eq!(free.inverse_mass, 0.0);
        free.set_fixed(false);
        assert!((free.inverse_mass - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_translate_keeps_velocity() {
        let mut p = Particle::new(Vec3::ZERO, 1.0);
        p.position = Vec3::new(0.1, 0.0, 0.0);
        p.translate(Vec3::new(5.0, 0.0, 0.0));
        assert!((p.implicit_velocity() - Vec3::new(0.1, 0.0, 0.0)).length() < 1e-6);
        p.zero_velocity();
        assert_eq!(p.implicit_velocity(), Vec3::ZERO);
    }
}
