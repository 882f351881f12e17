//! CUDA backing for the device ring (behind the `cuda` cargo feature).
//!
//! The pool is one `cuMemAlloc` allocation, exported to sibling processes
//! as a `CUipcMemHandle` stored in the ring's export record. Importers
//! open the handle against the same device ordinal; copies go through the
//! driver's synchronous DMA entry points.

use std::os::raw::c_void;

use cuda_driver_sys::{
    cuCtxSetCurrent, cuDeviceGet, cuDevicePrimaryCtxRetain, cuInit, cuIpcCloseMemHandle,
    cuIpcGetMemHandle, cuIpcOpenMemHandle, cuMemAlloc_v2, cuMemFree_v2, cuMemcpyDtoD_v2,
    cuMemcpyDtoH_v2, cuMemcpyHtoD_v2, CUcontext, CUdevice, CUdeviceptr, CUipcMemHandle,
    CUresult,
};
use shared::errors::AllocError;
use shared::layout::DeviceExport;

/// `CU_IPC_MEM_LAZY_ENABLE_PEER_ACCESS`
const IPC_OPEN_FLAGS: u32 = 1;

/// `cuMemAlloc` returns allocations aligned to at least this many bytes,
/// which is therefore the pool-size granularity peers can rely on.
const CUDA_ALLOC_GRANULARITY: usize = 256;

pub(crate) struct CudaDriver {
    ordinal: u16,
    dptr: CUdeviceptr,
    pool_size: usize,
    imported: bool,
}

// The device pointer is a plain address into device memory; the driver
// serializes access internally.
unsafe impl Send for CudaDriver {}
unsafe impl Sync for CudaDriver {}

fn check(res: CUresult, what: &str) -> Result<(), AllocError> {
    if res == CUresult::CUDA_SUCCESS {
        Ok(())
    } else {
        Err(AllocError::Device(format!("{what} failed: {res:?}")))
    }
}

/// Bind the calling thread to the device's primary context.
fn ensure_context(ordinal: u16) -> Result<(), AllocError> {
    unsafe {
        check(cuInit(0), "cuInit")?;
        let mut dev: CUdevice = 0;
        check(cuDeviceGet(&mut dev, ordinal as i32), "cuDeviceGet")?;
        let mut ctx: CUcontext = std::ptr::null_mut();
        check(
            cuDevicePrimaryCtxRetain(&mut ctx, dev),
            "cuDevicePrimaryCtxRetain",
        )?;
        check(cuCtxSetCurrent(ctx), "cuCtxSetCurrent")
    }
}

impl CudaDriver {
    pub(crate) fn granularity(_ordinal: u16) -> Result<usize, AllocError> {
        Ok(CUDA_ALLOC_GRANULARITY)
    }

    /// Allocate the pool and export its IPC handle.
    pub(crate) fn create(
        ordinal: u16,
        pool_size: usize,
    ) -> Result<(Self, DeviceExport), AllocError> {
        ensure_context(ordinal)?;
        let mut dptr: CUdeviceptr = 0;
        unsafe { check(cuMemAlloc_v2(&mut dptr, pool_size), "cuMemAlloc")? };

        let mut handle = CUipcMemHandle { reserved: [0; 64] };
        let got = unsafe { cuIpcGetMemHandle(&mut handle, dptr) };
        if let Err(e) = check(got, "cuIpcGetMemHandle") {
            unsafe { cuMemFree_v2(dptr) };
            return Err(e);
        }

        let mut export = DeviceExport {
            backing_id: 0,
            owner_pid: std::process::id(),
            pool_size: pool_size as u64,
            ipc_handle: [0; 64],
        };
        for (dst, src) in export.ipc_handle.iter_mut().zip(handle.reserved) {
            *dst = src as u8;
        }
        Ok((
            CudaDriver {
                ordinal,
                dptr,
                pool_size,
                imported: false,
            },
            export,
        ))
    }

    /// Open a pool another process exported.
    pub(crate) fn import(export: &DeviceExport, ordinal: u16) -> Result<Self, AllocError> {
        ensure_context(ordinal)?;
        let mut handle = CUipcMemHandle { reserved: [0; 64] };
        for (dst, src) in handle.reserved.iter_mut().zip(export.ipc_handle) {
            *dst = src as i8;
        }
        let mut dptr: CUdeviceptr = 0;
        unsafe {
            check(
                cuIpcOpenMemHandle(&mut dptr, handle, IPC_OPEN_FLAGS),
                "cuIpcOpenMemHandle",
            )?
        };
        Ok(CudaDriver {
            ordinal,
            dptr,
            pool_size: export.pool_size as usize,
            imported: true,
        })
    }

    pub(crate) fn ordinal(&self) -> u16 {
        self.ordinal
    }

    pub(crate) fn base_addr(&self) -> usize {
        self.dptr as usize
    }

    fn range(&self, rel: usize, len: usize) -> Result<CUdeviceptr, AllocError> {
        if rel + len > self.pool_size {
            return Err(AllocError::Device(format!(
                "cuda pool: range {rel}+{len} outside {} bytes",
                self.pool_size
            )));
        }
        Ok(self.dptr + rel as CUdeviceptr)
    }

    pub(crate) fn copy_to(&self, rel: usize, src: &[u8]) -> Result<(), AllocError> {
        let dst = self.range(rel, src.len())?;
        unsafe {
            check(
                cuMemcpyHtoD_v2(dst, src.as_ptr() as *const c_void, src.len()),
                "cuMemcpyHtoD",
            )
        }
    }

    pub(crate) fn copy_from(&self, rel: usize, dst: &mut [u8]) -> Result<(), AllocError> {
        let src = self.range(rel, dst.len())?;
        unsafe {
            check(
                cuMemcpyDtoH_v2(dst.as_mut_ptr() as *mut c_void, src, dst.len()),
                "cuMemcpyDtoH",
            )
        }
    }

    /// Same-device copy between two pools.
    pub(crate) fn copy_on_device(
        &self,
        dst_rel: usize,
        src: &CudaDriver,
        src_rel: usize,
        len: usize,
    ) -> Result<(), AllocError> {
        let dst = self.range(dst_rel, len)?;
        let from = src.range(src_rel, len)?;
        unsafe { check(cuMemcpyDtoD_v2(dst, from, len), "cuMemcpyDtoD") }
    }
}

impl Drop for CudaDriver {
    fn drop(&mut self) {
        unsafe {
            if self.imported {
                let _ = cuIpcCloseMemHandle(self.dptr);
            } else {
                let _ = cuMemFree_v2(self.dptr);
            }
        }
    }
}
