// Software blitting into a softbuffer framebuffer (u32 per pixel, 0x00RRGGBB).

pub const BG_COLOR: [u8; 3] = [31, 31, 31];

/// Pack RGB into softbuffer u32 format: 0x00RRGGBB.
pub fn rgb(r: u8, g: u8, b: u8) -> u32 {
    (r as u32) << 16 | (g as u32) << 8 | b as u32
}

fn unpack_rgb(v: u32) -> (u8, u8, u8) {
    ((v >> 16) as u8, (v >> 8) as u8, v as u8)
}

/// Scale that fits the image inside the window without upscaling past 1:1.
pub fn fit_scale(img_w: f32, img_h: f32, win_w: f32, win_h: f32) -> f32 {
    (win_w / img_w).min(win_h / img_h).min(1.0)
}

/// Nearest-neighbour blit of RGBA8 rows (`src_stride` bytes each) with
/// alpha blending against what is already in `dst`.
pub fn blit_scaled(
    dst: &mut [u32], dst_w: u32, dst_h: u32,
    src: &[u8], src_w: u32, src_h: u32, src_stride: usize,
    x0: f32, y0: f32, scale: f32,
) {
    if scale <= 0.0 || src_w == 0 || src_h == 0 {
        return;
    }
    let draw_w = src_w as f32 * scale;
    let draw_h = src_h as f32 * scale;

    let dx_start = x0.max(0.0) as u32;
    let dy_start = y0.max(0.0) as u32;
    let dx_end = ((x0 + draw_w).ceil().max(0.0) as u32).min(dst_w);
    let dy_end = ((y0 + draw_h).ceil().max(0.0) as u32).min(dst_h);

    let inv_scale = 1.0 / scale;

    for dy in dy_start..dy_end {
        let sy = ((dy as f32 - y0) * inv_scale) as u32;
        if sy >= src_h {
            continue;
        }
        let row = sy as usize * src_stride;
        for dx in dx_start..dx_end {
            let sx = ((dx as f32 - x0) * inv_scale) as u32;
            if sx >= src_w {
                continue;
            }
            let si = row + sx as usize * 4;
            let Some(px) = src.get(si..si + 4) else { continue };
            let di = dy as usize * dst_w as usize + dx as usize;

            let sa = px[3] as u32;
            if sa == 255 {
                dst[di] = rgb(px[0], px[1], px[2]);
            } else if sa > 0 {
                let inv = 255 - sa;
                let (dr, dg, db) = unpack_rgb(dst[di]);
                let r = ((px[0] as u32 * sa + dr as u32 * inv) / 255) as u8;
                let g = ((px[1] as u32 * sa + dg as u32 * inv) / 255) as u8;
                let b = ((px[2] as u32 * sa + db as u32 * inv) / 255) as u8;
                dst[di] = rgb(r, g, b);
            }
        }
    }
}
