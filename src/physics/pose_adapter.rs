//! 姿态适配器 - 动画姿态与粒子之间的换算
//!
//! 读取：骨骼世界变换 → 粒子的动画姿态（末端虚拟粒子沿最后一节外推）
//! 写回：从根到尖，对每根骨骼施加"动画方向 → 模拟方向"的最小摆动旋转，
//! 扭转保留动画姿态；写回位置保持动画姿态中的骨骼长度。

use glam::{Mat4, Quat, Vec3};

use super::chain::Chain;
use crate::skeleton::BoneSet;

/// 姿态适配器
pub struct PoseAdapter;

impl PoseAdapter {
    /// 读入动画姿态（世界空间，每根骨骼一个矩阵）
    ///
    /// 根粒子每帧原样使用动画位置（在积分时吸附）。
    pub fn read(chain: &mut Chain, pose: &[Mat4]) {
        let tip_length = chain.settings.virtual_tip_length;
        let particles = &mut chain.particles;

        for i in 0..particles.len() {
            match particles[i].bone_index {
                Some(bone) => {
                    let Some(transform) = pose.get(bone) else {
                        continue;
                    };
                    let (scale, rotation, translation) = transform.to_scale_rotation_translation();
                    particles[i].set_pose(translation, rotation, scale);
                }
                None => {
                    let Some(parent) = particles[i].parent else {
                        continue;
                    };
                    let last = &particles[parent];
                    let mut direction = match last.parent {
                        Some(grand) => (last.pose_position - particles[grand].pose_position).normalize_or_zero(),
                        None => Vec3::ZERO,
                    };
                    if direction == Vec3::ZERO {
                        // 单骨骼链或零长度骨骼：沿骨骼 +Y 轴
                        direction = (last.pose_rotation * Vec3::Y).normalize_or_zero();
                    }
                    let position = last.pose_position + direction * tip_length;
                    let (rotation, scale) = (last.pose_rotation, last.pose_scale);
                    particles[i].set_pose(position, rotation, scale);
                }
            }
        }
    }

    /// 写回世界姿态
    ///
    /// `changed` 中被写入的骨骼会被标记为 true，虚拟粒子不写回。
    pub fn write(chain: &mut Chain, pose: &mut [Mat4], changed: &mut [bool]) {
        let particles = &mut chain.particles;
        let written = &mut chain.written;
        let count = particles.len();

        // 位置：沿模拟方向，长度取动画姿态
        written.clear();
        for i in 0..count {
            let particle = &particles[i];
            let position = match particle.parent {
                Some(parent) if i > 0 => {
                    let parent_particle = &particles[parent];
                    let pose_offset = particle.pose_position - parent_particle.pose_position;
                    let mut direction = (particle.position - parent_particle.position).normalize_or_zero();
                    if direction == Vec3::ZERO {
                        direction = pose_offset.normalize_or_zero();
                    }
                    written[parent] + direction * pose_offset.length()
                }
                _ => particle.position,
            };
            written.push(position);
        }

        // 旋转：动画方向 → 模拟方向的最小摆动
        for i in 0..count {
            let particle = &particles[i];
            let child = if particle.is_tip() {
                None
            } else {
                (i + 1..count).find(|&c| particles[c].parent == Some(i))
            };
            let mut rotation = particle.pose_rotation;
            if let Some(child) = child {
                let animated = (particles[child].pose_position - particle.pose_position).normalize_or_zero();
                let simulated = (written[child] - written[i]).normalize_or_zero();
                if animated != Vec3::ZERO && simulated != Vec3::ZERO {
                    rotation = (Quat::from_rotation_arc(animated, simulated) * particle.pose_rotation).normalize();
                }
            }

            let particle = &mut particles[i];
            particle.rotation = rotation;
            if particle.is_virtual() {
                continue;
            }
            let Some(bone) = particle.bone_index else {
                continue;
            };
            if let (Some(target), Some(flag)) = (pose.get_mut(bone), changed.get_mut(bone)) {
                *target = Mat4::from_scale_rotation_translation(particle.pose_scale, rotation, written[i]);
                *flag = true;
            }
        }
    }

    /// 链驱动骨骼的本地变换（parent_world⁻¹ · world）
    pub fn local_overrides(chain: &Chain, bones: &BoneSet, pose: &[Mat4], out: &mut Vec<(usize, Mat4)>) {
        for bone in chain.bone_indices() {
            let Some(world) = pose.get(bone) else {
                continue;
            };
            let local = match bones.parent_of(bone).and_then(|parent| pose.get(parent)) {
                Some(parent_world) => parent_world.inverse() * *world,
                None => *world,
            };
            out.push((bone, local));
        }
    }
}
