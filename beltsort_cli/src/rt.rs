//! Optional real-time mode: lock memory, pin to a CPU, raise to SCHED_FIFO.

#[cfg(target_os = "linux")]
pub fn apply_rt_mode() {
    use libc::{
        CPU_SET, CPU_ZERO, MCL_CURRENT, MCL_FUTURE, SCHED_FIFO, mlockall, sched_param,
        sched_setscheduler,
    };
    unsafe {
        mlockall(MCL_CURRENT | MCL_FUTURE);
    }
    let mut param = sched_param { sched_priority: 80 };
    let rc = unsafe { sched_setscheduler(0, SCHED_FIFO, &mut param) };
    if rc != 0 {
        tracing::warn!("SCHED_FIFO unavailable (need CAP_SYS_NICE); continuing best-effort");
    }
    let mut cpuset: libc::cpu_set_t = unsafe { std::mem::zeroed() };
    unsafe {
        CPU_ZERO(&mut cpuset);
        CPU_SET(0, &mut cpuset);
        libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &cpuset);
    }
    tracing::info!("real-time mode applied");
}

#[cfg(not(target_os = "linux"))]
pub fn apply_rt_mode() {
    tracing::warn!("real-time mode is only supported on Linux; ignoring --rt");
}
