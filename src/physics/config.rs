//! 骨骼链模拟配置
//!
//! 所有参数扁平化，编辑器/资源层产出 ChainSettings，运行时只读。
//! 构建 Chain 前调用 validate()，非法配置直接返回错误。

use glam::Vec3;

use crate::{Result, VerletError};

/// 约束求解顺序
///
/// 顺序会影响结果，这里作为可调策略暴露。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ConstraintOrder {
    /// 按链接分组，从根到尖：距离 → 角度 → 长度限制 → 平面/钉住
    #[default]
    ChainOrder,
    /// 按类型分组：全部距离 → 全部角度 → 全部平面 → 全部长度限制与钉住
    ByKind,
}

/// 锥形角度约束的参考方向
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ConeReference {
    /// 动画姿态中父 → 子方向
    #[default]
    AnimatedPose,
    /// 当前模拟中祖父 → 父方向（第一节退回动画姿态）
    ParentDirection,
}

/// 链参与哪些碰撞体
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum ColliderSelection {
    /// CollisionSet 中全部启用的碰撞体
    #[default]
    All,
    /// 仅按名称选中的碰撞体
    Named(Vec<String>),
    /// 不参与碰撞
    None,
}

/// 预设
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SimulationPreset {
    /// 贴近动画姿态，轻微晃动
    AnimationPose,
    /// 纯物理表现
    Physics,
}

/// 平面钉住配置（世界空间平面）
#[derive(Clone, Debug, PartialEq)]
pub struct PlanarPinSettings {
    /// 被约束的骨骼
    pub bone: String,
    /// 平面上一点
    pub point: Vec3,
    /// 平面法线（粒子被限制在法线一侧）
    pub normal: Vec3,
}

/// 单条骨骼链的配置（扁平化，不嵌套）
#[derive(Debug, Clone)]
pub struct ChainSettings {
    // ========== 骨骼链 ==========
    /// 链名称（用于日志与错误信息）
    pub name: String,
    /// 从根到尖的骨骼名称，相邻骨骼必须是祖先 → 后代关系
    pub bones: Vec<String>,
    /// 末端虚拟粒子长度，0 表示不创建
    /// 末端骨骼需要一个子粒子才能计算旋转
    pub virtual_tip_length: f32,
    /// 钉住末端骨骼（允许的偏移），None 表示不钉住
    pub lock_tip: Option<f32>,
    /// 每个自由粒子的质量
    pub mass: f32,
    /// 粒子碰撞半径（骨骼厚度）
    pub particle_radius: f32,

    // ========== 积分 ==========
    /// 隐式速度保留系数，(0, 1]
    pub damping: f32,
    /// 按目标帧率修正阻尼：damping^(dt * fps)
    pub damping_reference_fps: Option<f32>,
    /// dt 上限（卡顿帧直接截断，不累积）
    pub max_delta_time: f32,
    /// 固定 dt，Some 时忽略真实 dt
    pub fixed_delta_time: Option<f32>,

    // ========== 约束 ==========
    /// 求解迭代次数，0 表示只积分不求解
    pub solver_iterations: u32,
    /// 距离约束刚度，[0, 1]
    pub stiffness: f32,
    /// 父子长度硬限制的容差，None 表示不添加
    pub length_margin: Option<f32>,
    /// 锥形角度限制（度），None 表示不限制
    pub cone_angle_degrees: Option<f32>,
    /// 锥形参考方向
    pub cone_reference: ConeReference,
    /// 约束求解顺序
    pub constraint_order: ConstraintOrder,
    /// 平面钉住
    pub planar_pins: Vec<PlanarPinSettings>,

    // ========== 碰撞 ==========
    pub colliders: ColliderSelection,

    // ========== 外力 ==========
    /// 全局重力缩放
    pub gravity_scale: f32,
    /// 全局风力缩放
    pub wind_scale: f32,
    /// 链专属的额外加速度（世界空间）
    pub external_force: Vec3,
    /// 朝动画姿态位置回拉的加速度
    pub shape_memory_force: f32,
    /// 沿动画姿态父 → 子方向拉伸的加速度
    pub stretch_force: f32,

    // ========== 动画姿态惯性 ==========
    /// 每帧向动画姿态靠拢的比例，[0, 1]
    pub pose_inertia: f32,
    /// 动画姿态帧间位移带来的惯性比例
    pub pose_delta_inertia: f32,
    /// 上述惯性位移的长度上限
    pub pose_delta_inertia_clamp: Option<f32>,

    // ========== 移动惯性 ==========
    /// 根骨骼移动对链的惯性影响，1.0 = 完全惯性（链被甩在后面），0.0 = 随根平移
    pub move_inertia_scale: f32,
    /// 超过此距离的根骨骼位移总是随根平移
    pub move_inertia_clamp: Option<f32>,
    /// 根骨骼单帧位移超过此值视为传送
    pub teleport_distance: Option<f32>,

    // ========== 旋转惯性 ==========
    /// 根骨骼旋转对链的惯性影响，1.0 = 完全惯性，0.0 = 随根旋转
    pub rotation_inertia_scale: f32,
    /// 超过此角度（度）的根骨骼旋转总是随根旋转
    pub rotation_inertia_clamp_degrees: Option<f32>,

    // ========== 休眠 ==========
    /// 链静止一段时间后停止模拟
    pub use_sleep: bool,
    /// 所有自由粒子的单帧位移都低于此值时计入静止时间
    pub sleep_delta_threshold: f32,
    /// 持续静止多久（秒）进入休眠
    pub sleep_trigger_duration: f32,
    /// 休眠中任一动画姿态单帧位移超过此值时唤醒
    pub wake_up_delta_threshold: f32,
}

impl Default for ChainSettings {
    fn default() -> Self {
        Self {
            name: String::new(),
            bones: Vec::new(),
            virtual_tip_length: 0.1,
            lock_tip: None,
            mass: 1.0,
            particle_radius: 0.003,

            damping: 0.9,
            damping_reference_fps: None,
            max_delta_time: 1.0 / 15.0,
            fixed_delta_time: None,

            solver_iterations: 4,
            stiffness: 0.8,
            length_margin: Some(0.001),
            cone_angle_degrees: None,
            cone_reference: ConeReference::AnimatedPose,
            constraint_order: ConstraintOrder::ChainOrder,
            planar_pins: Vec::new(),

            colliders: ColliderSelection::All,

            gravity_scale: 1.0,
            wind_scale: 1.0,
            external_force: Vec3::ZERO,
            shape_memory_force: 0.0,
            stretch_force: 0.0,

            pose_inertia: 0.0,
            pose_delta_inertia: 0.0,
            pose_delta_inertia_clamp: None,

            move_inertia_scale: 1.0,
            move_inertia_clamp: None,
            teleport_distance: Some(1.0),

            rotation_inertia_scale: 1.0,
            rotation_inertia_clamp_degrees: Some(30.0),

            use_sleep: true,
            sleep_delta_threshold: 0.0005,
            sleep_trigger_duration: 5.0,
            wake_up_delta_threshold: 0.001,
        }
    }
}

impl ChainSettings {
    /// 按骨骼名称创建
    pub fn new<S: Into<String>>(name: impl Into<String>, bones: impl IntoIterator<Item = S>) -> Self {
        Self {
            name: name.into(),
            bones: bones.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    /// 从预设创建
    pub fn from_preset(preset: SimulationPreset) -> Self {
        let mut settings = Self::default();
        settings.apply_preset(preset);
        settings
    }

    /// 覆盖预设相关的字段，其余保持不变
    pub fn apply_preset(&mut self, preset: SimulationPreset) {
        match preset {
            SimulationPreset::AnimationPose => {
                self.damping = 0.8;
                self.solver_iterations = 1;
                self.gravity_scale = 0.1;
                self.pose_inertia = 0.03;
                self.pose_delta_inertia = 0.03;
                self.pose_delta_inertia_clamp = Some(0.001);
            }
            SimulationPreset::Physics => {
                self.damping = 0.9;
                self.solver_iterations = 4;
                self.gravity_scale = 1.0;
                self.pose_inertia = 0.0;
                self.pose_delta_inertia = 0.0;
                self.pose_delta_inertia_clamp = None;
            }
        }
    }

    /// 本帧实际使用的 dt（已截断）
    pub fn effective_delta_time(&self, delta_time: f32) -> f32 {
        if !(delta_time > 0.0) {
            return 0.0;
        }
        match self.fixed_delta_time {
            Some(fixed) => fixed,
            None => delta_time.min(self.max_delta_time),
        }
    }

    /// 校验配置
    pub fn validate(&self) -> Result<()> {
        fn invalid(name: &'static str, reason: impl Into<String>) -> Result<()> {
            Err(VerletError::InvalidSetting {
                name,
                reason: reason.into(),
            })
        }

        if self.bones.is_empty() {
            return Err(VerletError::ChainTooShort {
                chain: self.name.clone(),
                count: 0,
            });
        }
        if !(self.particle_radius >= 0.0) {
            return Err(VerletError::NegativeRadius {
                owner: self.name.clone(),
                radius: self.particle_radius,
            });
        }
        if !(self.damping > 0.0 && self.damping <= 1.0) {
            return invalid("damping", format!("{} is outside (0, 1]", self.damping));
        }
        if !(0.0..=1.0).contains(&self.stiffness) {
            return invalid("stiffness", format!("{} is outside [0, 1]", self.stiffness));
        }
        if !(self.mass > 0.0) {
            return invalid("mass", format!("{} must be positive", self.mass));
        }
        if !(self.max_delta_time > 0.0) {
            return invalid("max_delta_time", "must be positive");
        }
        if let Some(fixed) = self.fixed_delta_time {
            if !(fixed > 0.0) {
                return invalid("fixed_delta_time", "must be positive");
            }
        }
        if let Some(fps) = self.damping_reference_fps {
            if !(fps > 0.0) {
                return invalid("damping_reference_fps", "must be positive");
            }
        }
        if self.virtual_tip_length < 0.0 {
            return invalid("virtual_tip_length", "must not be negative");
        }
        if let Some(angle) = self.cone_angle_degrees {
            if !(0.0..=180.0).contains(&angle) {
                return invalid("cone_angle_degrees", format!("{angle} is outside [0, 180]"));
            }
        }
        if matches!(self.length_margin, Some(m) if m < 0.0) {
            return invalid("length_margin", "must not be negative");
        }
        if matches!(self.lock_tip, Some(m) if m < 0.0) {
            return invalid("lock_tip", "must not be negative");
        }
        if !(0.0..=1.0).contains(&self.pose_inertia) {
            return invalid("pose_inertia", "must be in [0, 1]");
        }
        if self.pose_delta_inertia < 0.0 {
            return invalid("pose_delta_inertia", "must not be negative");
        }
        if self.move_inertia_scale < 0.0 {
            return invalid("move_inertia_scale", "must not be negative");
        }
        if matches!(self.teleport_distance, Some(d) if !(d > 0.0)) {
            return invalid("teleport_distance", "must be positive");
        }
        if !(self.rotation_inertia_scale >= 0.0) {
            return invalid("rotation_inertia_scale", "must not be negative");
        }
        if matches!(self.rotation_inertia_clamp_degrees, Some(d) if !(d >= 0.0)) {
            return invalid("rotation_inertia_clamp_degrees", "must not be negative");
        }
        if self.use_sleep {
            if !(self.sleep_delta_threshold >= 0.0) || !(self.wake_up_delta_threshold >= 0.0) {
                return invalid("sleep_delta_threshold", "sleep thresholds must not be negative");
            }
            if !(self.sleep_trigger_duration >= 0.0) {
                return invalid("sleep_trigger_duration", "must not be negative");
            }
        }
        for pin in &self.planar_pins {
            if pin.normal.length_squared() < 1e-12 {
                return invalid("planar_pins", format!("plane for '{}' has a zero normal", pin.bone));
            }
        }
        Ok(())
    }
}
