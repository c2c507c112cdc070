//! Launch surface of the scheduler kernel.
//!
//! The host fills a [`KernelArgs`] blob with raw addresses and starts one
//! scheduler thread per AICPU core; each calls [`kernel_server`] with its own
//! thread index after a single [`kernel_server_init`].

use crate::{
    config::{MAX_AICPU_THREADS, MAX_DEVICE_ID},
    error::{ConfigError, ExecError},
    executor::{RunContext, ThreadReport},
    handshake::Handshake,
    logging,
};
use core::{ptr, slice};
use log::{debug, info};

/// Per-device parameters referenced by [`KernelArgs::device_args`].
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
#[repr(C)]
pub struct DeviceArgs {
    pub nr_aic: u32,
    pub nr_aiv: u32,
    /// Scheduler threads; 0 is treated as 1.
    pub sche_cpu_num: u32,
    pub device_id: u32,
    /// Address and length of the scheduler binary image.
    pub aicpu_so_bin: u64,
    pub aicpu_so_len: u64,
}

/// Launch blob passed to the scheduler kernel.
///
/// `reserved` belongs to the launching runtime and is never read.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
#[repr(C)]
pub struct KernelArgs {
    pub reserved: [u64; 5],
    /// Address of a [`DeviceArgs`].
    pub device_args: u64,
    /// Address of the first of `core_num` [`Handshake`] channels.
    pub hank_args: u64,
    pub core_num: i64,
    /// Address of the [`RunContext`] of the run.
    pub graph_args: u64,
}

#[cfg(not(feature = "loom"))]
mod layout {
    use super::{DeviceArgs, KernelArgs};
    use core::mem::{offset_of, size_of};
    use static_assertions::const_assert_eq;

    const_assert_eq!(size_of::<KernelArgs>(), 72);
    const_assert_eq!(offset_of!(KernelArgs, device_args), 40);
    const_assert_eq!(offset_of!(KernelArgs, hank_args), 48);
    const_assert_eq!(offset_of!(KernelArgs, core_num), 56);
    const_assert_eq!(offset_of!(KernelArgs, graph_args), 64);
    const_assert_eq!(size_of::<DeviceArgs>(), 32);
}

fn address<T>(value: &T) -> u64 {
    ptr::from_ref(value) as usize as u64
}

impl KernelArgs {
    /// Blob describing `device` and the run behind `context`.
    ///
    /// The blob stores raw addresses: it is only meaningful while `device`
    /// and `context` are alive.
    #[must_use]
    pub fn new(device: &DeviceArgs, context: &RunContext<'_>) -> Self {
        let channels = context.channels();
        Self {
            reserved: [0; 5],
            device_args: address(device),
            hank_args: channels.as_ptr() as usize as u64,
            core_num: channels.len() as i64,
            graph_args: address(context),
        }
    }
}

/// Typed view of a [`KernelArgs`] blob.
#[derive(Debug)]
pub struct LaunchView<'a> {
    pub device: &'a DeviceArgs,
    pub channels: &'a [Handshake],
    pub context: &'a RunContext<'a>,
}

impl<'a> LaunchView<'a> {
    /// Interprets the addresses in `args` and checks them against each other.
    ///
    /// # Safety
    /// Every non-zero address in `args` must point to a live object of the
    /// documented type (`hank_args` to `core_num` channels) that outlives
    /// `'a`.
    ///
    /// # Errors
    /// `NullArguments` for a zero address, `InvalidCore` when the channel
    /// array disagrees with the run context, `Config` when the device
    /// parameters are out of range or disagree with the run context.
    pub unsafe fn from_args(args: &'a KernelArgs) -> Result<Self, ExecError> {
        if args.device_args == 0 || args.hank_args == 0 || args.graph_args == 0 {
            return Err(ExecError::NullArguments);
        }
        let core_num = usize::try_from(args.core_num).map_err(|_| ConfigError::InvalidValue {
            key: "core_num",
            reason: format!("negative core count {}", args.core_num),
        })?;
        // SAFETY: non-null, valid for `'a` per the caller's contract.
        let (device, channels, context) = unsafe {
            (
                &*(args.device_args as usize as *const DeviceArgs),
                slice::from_raw_parts(args.hank_args as usize as *const Handshake, core_num),
                &*(args.graph_args as usize as *const RunContext<'a>),
            )
        };

        if device.device_id > MAX_DEVICE_ID {
            return Err(ConfigError::InvalidDeviceId(device.device_id).into());
        }
        let thread_num = device.sche_cpu_num.max(1) as usize;
        if thread_num > MAX_AICPU_THREADS || thread_num != context.thread_num() {
            return Err(ConfigError::InvalidThreadNum(thread_num).into());
        }
        let assignment = context.assignment();
        if (device.nr_aic as usize, device.nr_aiv as usize) != (assignment.aic_num(), assignment.aiv_num()) {
            return Err(ConfigError::InvalidValue {
                key: "nr_aic/nr_aiv",
                reason: format!(
                    "device reports {}+{} cores, run expects {}+{}",
                    device.nr_aic,
                    device.nr_aiv,
                    assignment.aic_num(),
                    assignment.aiv_num()
                ),
            }
            .into());
        }
        if !ptr::eq(channels, context.channels()) {
            return Err(ExecError::InvalidCore {
                core_id: core_num,
                core_num: context.channels().len(),
            });
        }
        Ok(Self {
            device,
            channels,
            context,
        })
    }
}

/// One-time initialization of the scheduler kernel.
///
/// # Errors
/// `NullArguments` without a launch blob.
pub fn kernel_server_init(args: Option<&KernelArgs>) -> Result<(), ExecError> {
    logging::initialize();
    let args = args.ok_or(ExecError::NullArguments)?;
    info!("scheduler kernel init: {} core(s)", args.core_num);
    Ok(())
}

/// Entry of scheduler thread `thread_idx`: handshake, execute, shutdown.
///
/// # Safety
/// As [`LaunchView::from_args`].
///
/// # Errors
/// `NullArguments` without a launch blob, the validation errors of
/// [`LaunchView::from_args`] and whatever [`RunContext::run_thread`]
/// reports.
pub unsafe fn kernel_server(args: Option<&KernelArgs>, thread_idx: usize) -> Result<ThreadReport, ExecError> {
    let args = args.ok_or(ExecError::NullArguments)?;
    // SAFETY: forwarded to the caller.
    let view = unsafe { LaunchView::from_args(args)? };
    debug!(
        "device {}: scheduler thread {thread_idx} starting, {} task(s)",
        view.device.device_id,
        view.context.graph().task_count()
    );
    view.context.run_thread(thread_idx)
}
