//! 约束求解（Gauss-Seidel 式逐个投影）
//!
//! 每一轮：按链中的顺序执行全部约束，再执行全部启用的碰撞体。
//! 迭代次数用完即停止，不检测收敛。

use super::chain::Chain;
use super::collision::CollisionShape;

/// 约束求解器
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ConstraintSolver {
    pub iterations: u32,
}

impl Default for ConstraintSolver {
    fn default() -> Self {
        Self { iterations: 4 }
    }
}

impl ConstraintSolver {
    pub fn new(iterations: u32) -> Self {
        Self { iterations }
    }

    /// `world_shapes` 与 CollisionSet 一一对应，None 表示本帧禁用
    pub fn solve(&self, chain: &mut Chain, world_shapes: &[Option<CollisionShape>]) {
        let particles = &mut chain.particles;
        for _ in 0..self.iterations {
            for constraint in &chain.constraints {
                constraint.solve(particles);
            }

            for collider in &chain.colliders {
                let Some(Some(shape)) = world_shapes.get(collider.index) else {
                    continue;
                };
                for (i, particle) in particles.iter_mut().enumerate() {
                    if collider.excluded.contains(&i) {
                        continue;
                    }
                    shape.resolve(particle);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use glam::Vec3;

    use super::*;
    use crate::physics::chain::ChainCollider;

    fn straight_chain(count: usize) -> Chain {
        let positions: Vec<Vec3> = (0..count).map(|i| Vec3::new(0.0, -(i as f32), 0.0)).collect();
        Chain::from_positions(&positions).unwrap()
    }

    #[test]
    fn test_single_link_converges() {
        let mut chain = Chain::from_positions(&[Vec3::ZERO, Vec3::new(0.0, -1.0, 0.0)]).unwrap();
        chain.particles_mut()[1].position = Vec3::new(0.0, -3.0, 0.0);

        ConstraintSolver::new(1).solve(&mut chain, &[]);
        let length = chain.particles()[1].position.distance(chain.particles()[0].position);
        assert!((length - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_zero_iterations_is_identity() {
        let mut chain = straight_chain(4);
        chain.particles_mut()[2].position = Vec3::new(0.7, -1.3, 0.2);
        let before: Vec<Vec3> = chain.particles().iter().map(|p| p.position).collect();

        let shapes = vec![Some(CollisionShape::sphere(Vec3::new(0.7, -1.3, 0.2), 1.0))];
        ConstraintSolver::new(0).solve(&mut chain, &shapes);

        let after: Vec<Vec3> = chain.particles().iter().map(|p| p.position).collect();
        assert_eq!(before, after);
    }

    #[test]
    fn test_collider_exclusion() {
        let mut chain = straight_chain(3);
        chain.colliders.push(ChainCollider {
            index: 0,
            excluded: vec![2],
        });
        let shapes = vec![Some(CollisionShape::sphere(Vec3::new(0.0, -1.5, 0.0), 0.6))];
        ConstraintSolver::new(1).solve(&mut chain, &shapes);

        // 粒子 1 被推出，粒子 2 被排除
        let p1 = chain.particles()[1].position;
        assert!(p1.distance(Vec3::new(0.0, -1.5, 0.0)) >= 0.6 - 1e-5);
        assert!(chain.particles()[2].position.distance(Vec3::new(0.0, -1.5, 0.0)) < 0.6);
    }

    #[test]
    fn test_disabled_collider_is_skipped() {
        let mut chain = straight_chain(2);
        chain.colliders.push(ChainCollider {
            index: 0,
            excluded: Vec::new(),
        });
        ConstraintSolver::new(4).solve(&mut chain, &[None]);
        assert_eq!(chain.particles()[1].position, Vec3::new(0.0, -1.0, 0.0));
    }
}
