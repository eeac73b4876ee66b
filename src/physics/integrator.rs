//! Verlet 积分
//!
//! new = position + (position - previous) * damping + acceleration * dt²
//!
//! 固定粒子直接吸附到动画姿态。加速度由重力、风场与链自身的附加力组成，
//! 附加项默认值全部为中性，默认配置下就是上面的公式本身。

use std::f32::consts::TAU;

use glam::Vec3;

use super::config::ChainSettings;
use super::particle::Particle;

/// 默认重力（Y 轴向上）
pub const DEFAULT_GRAVITY: Vec3 = Vec3::new(0.0, -9.8, 0.0);

// ============================================================================
// 风场
// ============================================================================

/// 风场（加速度，世界空间）
///
/// 同一 (position, time) 总是得到同一结果。
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub enum WindField {
    #[default]
    Calm,
    Uniform(Vec3),
    /// 沿 direction 的阵风，强度 speed ± gust_amplitude，随时间与空间正弦变化
    Gusty {
        direction: Vec3,
        speed: f32,
        gust_amplitude: f32,
        /// 每秒阵风次数
        gust_frequency: f32,
        /// 沿风向每米的相位变化（弧度）
        spatial_frequency: f32,
    },
}

impl WindField {
    pub fn sample(&self, position: Vec3, time: f32) -> Vec3 {
        match *self {
            WindField::Calm => Vec3::ZERO,
            WindField::Uniform(wind) => wind,
            WindField::Gusty {
                direction,
                speed,
                gust_amplitude,
                gust_frequency,
                spatial_frequency,
            } => {
                let dir = direction.normalize_or_zero();
                let phase = TAU * gust_frequency * time - spatial_frequency * position.dot(dir);
                dir * (speed + gust_amplitude * phase.sin())
            }
        }
    }
}

/// 本帧的外部力
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Forces {
    pub gravity: Vec3,
    pub wind: WindField,
    /// 风场采样用的模拟时间
    pub time: f32,
}

impl Default for Forces {
    fn default() -> Self {
        Self {
            gravity: DEFAULT_GRAVITY,
            wind: WindField::Calm,
            time: 0.0,
        }
    }
}

impl Forces {
    /// 无重力无风
    pub fn none() -> Self {
        Self {
            gravity: Vec3::ZERO,
            ..Default::default()
        }
    }
}

// ============================================================================
// 积分器
// ============================================================================

/// 积分器参数（从 ChainSettings 提取）
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Integrator {
    pub damping: f32,
    pub damping_reference_fps: Option<f32>,
    pub gravity_scale: f32,
    pub wind_scale: f32,
    pub external_force: Vec3,
    pub shape_memory_force: f32,
    pub stretch_force: f32,
    pub pose_inertia: f32,
    pub pose_delta_inertia: f32,
    pub pose_delta_inertia_clamp: Option<f32>,
}

impl Default for Integrator {
    fn default() -> Self {
        Self::from_settings(&ChainSettings::default())
    }
}

impl Integrator {
    pub fn from_settings(settings: &ChainSettings) -> Self {
        Self {
            damping: settings.damping,
            damping_reference_fps: settings.damping_reference_fps,
            gravity_scale: settings.gravity_scale,
            wind_scale: settings.wind_scale,
            external_force: settings.external_force,
            shape_memory_force: settings.shape_memory_force,
            stretch_force: settings.stretch_force,
            pose_inertia: settings.pose_inertia,
            pose_delta_inertia: settings.pose_delta_inertia,
            pose_delta_inertia_clamp: settings.pose_delta_inertia_clamp,
        }
    }

    /// 本帧实际阻尼
    pub fn effective_damping(&self, dt: f32) -> f32 {
        match self.damping_reference_fps {
            Some(fps) => self.damping.powf(dt * fps),
            None => self.damping,
        }
    }

    /// 积分一步
    ///
    /// `dt` 应已截断；粒子按父先于子排列。dt <= 0 时不做任何事。
    pub fn step(&self, particles: &mut [Particle], dt: f32, forces: &Forces) {
        if !(dt > 0.0) {
            return;
        }
        let damping = self.effective_damping(dt);
        let dt2 = dt * dt;
        let base_acceleration = forces.gravity * self.gravity_scale + self.external_force;

        for i in 0..particles.len() {
            // 父粒子已在本轮更新
            let parent = particles[i]
                .parent
                .map(|j| (particles[j].position, particles[j].pose_position));

            let p = &mut particles[i];
            if p.is_fixed() {
                p.previous_position = p.position;
                p.position = p.pose_position;
                continue;
            }

            let mut acceleration = base_acceleration;
            if forces.wind != WindField::Calm && self.wind_scale != 0.0 {
                acceleration += forces.wind.sample(p.position, forces.time) * self.wind_scale;
            }
            if self.shape_memory_force != 0.0 {
                acceleration += (p.pose_position - p.position) * self.shape_memory_force;
            }
            if self.stretch_force != 0.0 {
                if let Some((_, parent_pose)) = parent {
                    let dir = (p.pose_position - parent_pose).normalize_or_zero();
                    acceleration += dir * self.stretch_force;
                }
            }

            let velocity = p.position - p.previous_position;
            let mut next = p.position + velocity * damping + acceleration * dt2;

            if self.pose_inertia > 0.0 {
                let target = match parent {
                    Some((parent_position, parent_pose)) => parent_position + (p.pose_position - parent_pose),
                    None => p.pose_position,
                };
                next = next.lerp(target, self.pose_inertia);
            }
            if self.pose_delta_inertia > 0.0 {
                let mut delta = (p.pose_position - p.prev_pose_position) * self.pose_delta_inertia;
                if let Some(max) = self.pose_delta_inertia_clamp {
                    delta = delta.clamp_length_max(max);
                }
                next += delta;
            }

            p.previous_position = p.position;
            p.position = next;
        }
    }
}
