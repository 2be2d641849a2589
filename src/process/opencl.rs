//! OpenCL fast path for the matcher and the averager.
//!
//! The kernels mirror the sequential math exactly: SSD accumulates in i32,
//! the parabolic fit runs in single-precision floats, and the averaging
//! kernel reproduces the histogram vote bucket for bucket. The CPU path
//! stays authoritative; any device, build or enqueue failure makes the
//! calling stage fall back and stay there.
//!
//! Device, context, program and kernel objects are created once per engine
//! and reused; a stage call only writes inputs, updates scalar arguments
//! and enqueues.

use ocl::{Buffer, Kernel, ProQue};

use crate::params::AveragingParameters;
use crate::process::StageGeometry;

const MATCH_KERNEL_SRC: &str = r#"
int block_ssd(__global const uchar* a, __global const uchar* b,
              const int img_w, const int ax, const int bx, const int y,
              const int mtc_h, const int mtc_w)
{
    int acc = 0;
    for (int j = 0; j < mtc_h; j++) {
        const int a_row = (y + j) * img_w + ax;
        const int b_row = (y + j) * img_w + bx;
        for (int i = 0; i < mtc_w; i++) {
            const int diff = (int)a[a_row + i] - (int)b[b_row + i];
            acc += diff * diff;
        }
    }
    return acc;
}

float refine(__global const uchar* a, __global const uchar* b,
             const int img_w, const int ax, const int bx_min, const int step,
             const int y, const int mtc_h, const int mtc_w, const int ssd_min)
{
    const int s_minus = block_ssd(a, b, img_w, ax, bx_min - step, y, mtc_h, mtc_w);
    const int s_plus = block_ssd(a, b, img_w, ax, bx_min + step, y, mtc_h, mtc_w);
    const int denom = 2 * (s_minus - 2 * ssd_min + s_plus);
    if (denom <= 0) {
        return 0.0f;
    }
    return (float)(s_minus - s_plus) / (float)denom;
}

__kernel void match_blocks(
    const int img_w, const int img_h,
    const int blk_w, const int blk_h,
    const int mtc_w, const int mtc_h,
    const int depth, const int crst_thr, const int crst_ofs, const int bgt_max,
    const int back_enabled,
    const int cols, const int rows,
    __global const uchar* reference,
    __global const uchar* compare,
    __global float* fwd,
    __global float* bwd,
    __global int* contrast)
{
    const int iblk = get_global_id(0);
    const int jblk = get_global_id(1);
    if (iblk >= cols || jblk >= rows) {
        return;
    }
    const int idx = jblk * cols + iblk;
    fwd[idx] = 0.0f;
    bwd[idx] = 0.0f;
    contrast[idx] = 0;

    const int x = iblk * blk_w;
    const int y = jblk * blk_h;
    if (y + mtc_h > img_h || x + mtc_w > img_w) {
        return;
    }

    int lmin = 255;
    int lmax = 0;
    int sum = 0;
    for (int j = 0; j < mtc_h; j++) {
        for (int i = 0; i < mtc_w; i++) {
            const int l = (int)reference[(y + j) * img_w + x + i];
            sum += l;
            lmin = min(lmin, l);
            lmax = max(lmax, l);
        }
    }
    int crst = 0;
    if (lmax >= bgt_max) {
        crst = ((lmax - lmin) * 1000 - crst_ofs) * (mtc_h * mtc_w) / sum;
    }
    contrast[idx] = crst;

    if (x + mtc_w + depth > img_w || crst < crst_thr) {
        return;
    }

    int d_min = 0;
    int ssd_min = INT_MAX;
    for (int d = 0; d < depth; d++) {
        const int s = block_ssd(reference, compare, img_w, x, x + d, y, mtc_h, mtc_w);
        if (s < ssd_min) {
            ssd_min = s;
            d_min = d;
        }
    }
    if (d_min > 0 && d_min + 1 < depth) {
        const float sub = refine(reference, compare, img_w, x, x + d_min, 1,
                                 y, mtc_h, mtc_w, ssd_min);
        fwd[idx] = (float)d_min + sub;
    }

    if (back_enabled) {
        const int range = min(x + 1, depth);
        if (range >= 3) {
            int bd_min = 0;
            int bssd_min = INT_MAX;
            for (int d = 0; d < range; d++) {
                const int s = block_ssd(compare, reference, img_w, x, x - d, y, mtc_h, mtc_w);
                if (s < bssd_min) {
                    bssd_min = s;
                    bd_min = d;
                }
            }
            if (bd_min > 0 && bd_min + 1 < range) {
                const float sub = refine(compare, reference, img_w, x, x - bd_min, -1,
                                         y, mtc_h, mtc_w, bssd_min);
                bwd[idx] = (float)bd_min + sub;
            }
        }
    }
}
"#;

const AVERAGE_KERNEL_SRC: &str = r#"
__kernel void average_disparity(
    const int cols, const int rows, const int valid_cols,
    const int depth, const int subpix,
    const int win_h, const int win_w,
    const int integ_range, const int limit_range,
    const int replace_ratio, const int disp_ratio, const int valid_ratio,
    const int w_center, const int w_near, const int w_round,
    __global const int* input,
    __global int* out_int,
    __global float* out_float)
{
    const int id = get_global_id(0);
    const int jd = get_global_id(1);
    if (id >= cols || jd >= rows) {
        return;
    }
    const int idx = jd * cols + id;

    if (id >= valid_cols ||
        jd < win_h || jd + win_h >= rows ||
        id < win_w || id + win_w >= valid_cols) {
        out_int[idx] = 0;
        out_float[idx] = 0.0f;
        return;
    }

    int poswgt[3];
    poswgt[0] = w_center;
    poswgt[1] = w_near;
    poswgt[2] = w_round;

    const int dspwdt = depth * subpix;
    const int bucket = dspwdt / 1024 + 1;
    const int n_buckets = dspwdt / bucket;

    int integ[1024];
    for (int i = 0; i < n_buckets; i++) {
        integ[i] = 0;
    }
    int dspblks[289];
    int wgtblks[289];
    int dspcnt = 0;
    int wgt_total = 0;
    int wgt_disp = 0;
    const int tgval = input[idx];

    for (int j = jd - win_h; j <= jd + win_h; j++) {
        for (int i = id - win_w; i <= id + win_w; i++) {
            const int disp = input[cols * j + i];
            const int jj = j - jd;
            const int ii = i - id;
            const int pos = jj * jj + ii * ii;
            int wgt = 1;
            if (pos < 3) {
                wgt = poswgt[pos];
            }
            wgt_total += wgt;
            if (disp > subpix) {
                dspblks[dspcnt] = disp;
                wgtblks[dspcnt] = wgt;
                dspcnt++;
                wgt_disp += wgt;
                int st = (disp - integ_range) / bucket;
                int en = (disp + integ_range) / bucket;
                st = st < 0 ? 0 : st;
                en = en >= n_buckets ? n_buckets - 1 : en;
                for (int k = st; k <= en; k++) {
                    integ[k] += wgt;
                }
            }
        }
    }

    const float density = (float)wgt_disp / wgt_total * 100.0f;
    if (density < disp_ratio) {
        out_int[idx] = 0;
        out_float[idx] = 0.0f;
        return;
    }

    int maxcnt = 0;
    int maxdsp = 0;
    int maxwnd = 0;
    bool maxin = false;
    for (int i = 0; i < n_buckets; i++) {
        if (integ[i] > maxcnt) {
            maxcnt = integ[i];
            maxdsp = i;
            maxwnd = 0;
            maxin = true;
        }
        if (maxin) {
            if (integ[i] == maxcnt) {
                maxwnd++;
            } else {
                maxin = false;
            }
        }
    }
    maxdsp += (maxwnd - 1) / 2;

    const int mode = maxdsp * bucket;
    int high = mode + limit_range;
    int low = mode - limit_range;
    high = high >= dspwdt ? dspwdt - 1 : high;
    low = low < 0 ? 0 : low;

    long sum = 0;
    int cnt = 0;
    for (int i = 0; i < dspcnt; i++) {
        if (dspblks[i] >= low && dspblks[i] <= high) {
            sum += (long)dspblks[i] * wgtblks[i];
            cnt += wgtblks[i];
        }
    }
    float ave = 0.0f;
    if (cnt != 0) {
        ave = (float)sum / cnt;
    }

    const float replace = (float)cnt / wgt_total * 100.0f;
    if ((tgval < low || tgval > high) && replace < replace_ratio) {
        out_int[idx] = 0;
        out_float[idx] = 0.0f;
        return;
    }

    const float ratio = (float)cnt / wgt_disp * 100.0f;
    if (ratio >= valid_ratio) {
        out_int[idx] = (int)ave;
        out_float[idx] = ave;
    } else {
        out_int[idx] = 0;
        out_float[idx] = 0.0f;
    }
}
"#;

/// GPU-resident block matcher.
pub struct GpuMatcher {
    pro_que: ProQue,
    kernel: Kernel,
    reference: Buffer<u8>,
    compare: Buffer<u8>,
    fwd: Buffer<f32>,
    bwd: Buffer<f32>,
    contrast: Buffer<i32>,
}

impl GpuMatcher {
    /// Builds the program and allocates device buffers for the geometry's
    /// maximum sizes.
    pub fn create(geom: &StageGeometry) -> ocl::Result<Self> {
        let cells = geom.rows() * geom.cols();
        let pixels = geom.img_w * geom.img_h;
        let pro_que = ProQue::builder()
            .src(MATCH_KERNEL_SRC)
            .dims([geom.cols(), geom.rows()])
            .build()?;

        let reference = pro_que.buffer_builder::<u8>().len(pixels).build()?;
        let compare = pro_que.buffer_builder::<u8>().len(pixels).build()?;
        let fwd = pro_que.buffer_builder::<f32>().len(cells).build()?;
        let bwd = pro_que.buffer_builder::<f32>().len(cells).build()?;
        let contrast = pro_que.buffer_builder::<i32>().len(cells).build()?;

        let kernel = pro_que
            .kernel_builder("match_blocks")
            .arg_named("img_w", geom.img_w as i32)
            .arg_named("img_h", geom.img_h as i32)
            .arg_named("blk_w", geom.blk_w as i32)
            .arg_named("blk_h", geom.blk_h as i32)
            .arg_named("mtc_w", geom.mtc_w as i32)
            .arg_named("mtc_h", geom.mtc_h as i32)
            .arg_named("depth", geom.depth as i32)
            .arg_named("crst_thr", 0i32)
            .arg_named("crst_ofs", 0i32)
            .arg_named("bgt_max", crate::frame::BRIGHTNESS_FLOOR)
            .arg_named("back_enabled", 0i32)
            .arg_named("cols", geom.cols() as i32)
            .arg_named("rows", geom.rows() as i32)
            .arg(&reference)
            .arg(&compare)
            .arg(&fwd)
            .arg(&bwd)
            .arg(&contrast)
            .build()?;

        Ok(Self {
            pro_que,
            kernel,
            reference,
            compare,
            fwd,
            bwd,
            contrast,
        })
    }

    /// Runs the match on the device; outputs land in the caller's slices.
    #[allow(clippy::too_many_arguments)]
    pub fn compute(
        &mut self,
        geom: &StageGeometry,
        crst_thr: i32,
        crst_ofs: i32,
        back_enabled: bool,
        reference: &[u8],
        compare: &[u8],
        fwd: &mut [f32],
        bwd: &mut [f32],
        contrast: &mut [i32],
    ) -> ocl::Result<()> {
        let cells = geom.rows() * geom.cols();
        self.reference.write(reference).enq()?;
        self.compare.write(compare).enq()?;

        self.kernel.set_arg("crst_thr", crst_thr)?;
        self.kernel.set_arg("crst_ofs", crst_ofs)?;
        self.kernel.set_arg("back_enabled", i32::from(back_enabled))?;

        // SAFETY: buffer lengths were allocated for this geometry and the
        // kernel guards its own bounds.
        #[allow(unsafe_code)]
        unsafe {
            self.kernel
                .cmd()
                .global_work_size([geom.cols(), geom.rows()])
                .enq()?;
        }
        self.pro_que.finish()?;

        self.fwd.read(&mut fwd[..cells]).enq()?;
        self.bwd.read(&mut bwd[..cells]).enq()?;
        self.contrast.read(&mut contrast[..cells]).enq()?;
        Ok(())
    }
}

/// GPU-resident averaging filter.
pub struct GpuAverager {
    pro_que: ProQue,
    kernel: Kernel,
    input: Buffer<i32>,
    out_int: Buffer<i32>,
    out_float: Buffer<f32>,
}

impl GpuAverager {
    /// Builds the program and allocates device buffers.
    pub fn create(geom: &StageGeometry) -> ocl::Result<Self> {
        let cells = geom.rows() * geom.cols();
        let pro_que = ProQue::builder()
            .src(AVERAGE_KERNEL_SRC)
            .dims([geom.cols(), geom.rows()])
            .build()?;

        let input = pro_que.buffer_builder::<i32>().len(cells).build()?;
        let out_int = pro_que.buffer_builder::<i32>().len(cells).build()?;
        let out_float = pro_que.buffer_builder::<f32>().len(cells).build()?;

        let kernel = pro_que
            .kernel_builder("average_disparity")
            .arg_named("cols", geom.cols() as i32)
            .arg_named("rows", geom.rows() as i32)
            .arg_named("valid_cols", geom.valid_cols() as i32)
            .arg_named("depth", geom.depth as i32)
            .arg_named("subpix", crate::frame::SUBPIXEL_SCALE)
            .arg_named("win_h", 0i32)
            .arg_named("win_w", 0i32)
            .arg_named("integ_range", 0i32)
            .arg_named("limit_range", 0i32)
            .arg_named("replace_ratio", 0i32)
            .arg_named("disp_ratio", 0i32)
            .arg_named("valid_ratio", 0i32)
            .arg_named("w_center", 1i32)
            .arg_named("w_near", 1i32)
            .arg_named("w_round", 1i32)
            .arg(&input)
            .arg(&out_int)
            .arg(&out_float)
            .build()?;

        Ok(Self {
            pro_que,
            kernel,
            input,
            out_int,
            out_float,
        })
    }

    /// Runs the filter on the device.
    pub fn compute(
        &mut self,
        geom: &StageGeometry,
        params: &AveragingParameters,
        wrk: &[i32],
        blkval: &mut [i32],
        avedsp: &mut [f32],
    ) -> ocl::Result<()> {
        self.input.write(wrk).enq()?;

        self.kernel.set_arg("win_h", params.win_h as i32)?;
        self.kernel.set_arg("win_w", params.win_w as i32)?;
        self.kernel.set_arg("integ_range", params.integ_range_q10)?;
        self.kernel.set_arg("limit_range", params.limit_range_q10)?;
        self.kernel.set_arg("replace_ratio", params.replace_ratio)?;
        self.kernel.set_arg("disp_ratio", params.disp_ratio)?;
        self.kernel.set_arg("valid_ratio", params.valid_ratio)?;
        self.kernel.set_arg("w_center", params.weight_center)?;
        self.kernel.set_arg("w_near", params.weight_near)?;
        self.kernel.set_arg("w_round", params.weight_round)?;

        // SAFETY: buffer lengths were allocated for this geometry and the
        // kernel guards its own bounds.
        #[allow(unsafe_code)]
        unsafe {
            self.kernel
                .cmd()
                .global_work_size([geom.cols(), geom.rows()])
                .enq()?;
        }
        self.pro_que.finish()?;

        self.out_int.read(blkval).enq()?;
        self.out_float.read(avedsp).enq()?;
        Ok(())
    }
}
