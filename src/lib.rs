// IRQSMP
// KEEPS THE HOST IRQ AFFINITY MASK AND THE irqbalance BANNED CPUS IN STEP
// WITH THE EXCLUSIVE CPUS KUBELET HANDS TO GUARANTEED PODS.

pub mod balancer;
pub mod banned;
pub mod checkpoint;
pub mod config;
pub mod cpuset;
pub mod event;
pub mod mask;
pub mod reconcile;
pub mod watch;
