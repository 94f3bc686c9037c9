use rand::Rng;

/// Identifier used for the mouse pointer slot. Touch contacts carry their
/// platform id; the mouse reuses slot zero with this sentinel.
pub const MOUSE_POINTER_ID: i64 = -1;

/// One active input contact, in normalized texture coordinates with v = 0
/// at the top edge. Released pointers keep their slot and just drop the
/// `down` flag.
#[derive(Debug, Clone)]
pub struct Pointer {
    pub id: i64,
    pub texcoord: [f32; 2],
    pub prev_texcoord: [f32; 2],
    pub delta: [f32; 2],
    pub down: bool,
    pub moved: bool,
    pub color: [f32; 3],
}

impl Default for Pointer {
    fn default() -> Self {
        Self {
            id: MOUSE_POINTER_ID,
            texcoord: [0.0, 0.0],
            prev_texcoord: [0.0, 0.0],
            delta: [0.0, 0.0],
            down: false,
            moved: false,
            color: generate_color(),
        }
    }
}

impl Pointer {
    pub fn update_down(&mut self, id: i64, pos: [f32; 2], screen: [f32; 2]) {
        self.id = id;
        self.down = true;
        self.moved = false;
        self.texcoord = normalize_position(pos, screen);
        self.prev_texcoord = self.texcoord;
        self.delta = [0.0, 0.0];
        self.color = generate_color();
    }

    pub fn update_move(&mut self, pos: [f32; 2], screen: [f32; 2]) {
        let aspect = screen[0] / screen[1];
        self.prev_texcoord = self.texcoord;
        self.texcoord = normalize_position(pos, screen);
        self.delta = [
            correct_delta_x(self.texcoord[0] - self.prev_texcoord[0], aspect),
            correct_delta_y(self.texcoord[1] - self.prev_texcoord[1], aspect),
        ];
        self.moved = self.delta[0].abs() > 0.0 || self.delta[1].abs() > 0.0;
    }

    pub fn update_up(&mut self) {
        self.down = false;
    }
}

fn normalize_position(pos: [f32; 2], screen: [f32; 2]) -> [f32; 2] {
    [pos[0] / screen[0], pos[1] / screen[1]]
}

/// A delta along the short axis of the window would cover more of the
/// field than the same delta along the long axis; scale it back so drags
/// feel isotropic.
pub fn correct_delta_x(delta: f32, aspect_ratio: f32) -> f32 {
    if aspect_ratio < 1.0 {
        delta * aspect_ratio
    } else {
        delta
    }
}

pub fn correct_delta_y(delta: f32, aspect_ratio: f32) -> f32 {
    if aspect_ratio > 1.0 {
        delta / aspect_ratio
    } else {
        delta
    }
}

/// Dim random hue used for new pointers and random splats.
pub fn generate_color() -> [f32; 3] {
    let mut rng = rand::thread_rng();
    let [r, g, b] = hsv_to_rgb(rng.gen::<f32>(), 1.0, 1.0);
    [r * 0.15, g * 0.15, b * 0.15]
}

pub fn hsv_to_rgb(h: f32, s: f32, v: f32) -> [f32; 3] {
    let i = (h * 6.0).floor();
    let f = h * 6.0 - i;
    let p = v * (1.0 - s);
    let q = v * (1.0 - f * s);
    let t = v * (1.0 - (1.0 - f) * s);

    match (i as i32).rem_euclid(6) {
        0 => [v, t, p],
        1 => [q, v, p],
        2 => [p, v, t],
        3 => [p, q, v],
        4 => [t, p, v],
        _ => [v, p, q],
    }
}

pub fn wrap(value: f32, min: f32, max: f32) -> f32 {
    let range = max - min;
    if range == 0.0 {
        return min;
    }
    (value - min) % range + min
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delta_correction_is_identity_for_square_windows() {
        assert_eq!(correct_delta_x(0.25, 1.0), 0.25);
        assert_eq!(correct_delta_y(0.25, 1.0), 0.25);
    }

    #[test]
    fn delta_correction_shrinks_short_axis_motion() {
        // Wide window: vertical deltas shrink, horizontal untouched.
        assert_eq!(correct_delta_x(0.2, 2.0), 0.2);
        assert!((correct_delta_y(0.2, 2.0) - 0.1).abs() < 1e-6);
        // Tall window: the other way around.
        assert!((correct_delta_x(0.2, 0.5) - 0.1).abs() < 1e-6);
        assert_eq!(correct_delta_y(0.2, 0.5), 0.2);
    }

    #[test]
    fn move_after_down_produces_zero_then_nonzero_delta() {
        let screen = [800.0, 600.0];
        let mut pointer = Pointer::default();
        pointer.update_down(MOUSE_POINTER_ID, [400.0, 300.0], screen);
        assert!(!pointer.moved);
        assert_eq!(pointer.delta, [0.0, 0.0]);

        pointer.update_move([440.0, 300.0], screen);
        assert!(pointer.moved);
        assert!(pointer.delta[0] > 0.0);
        assert_eq!(pointer.delta[1], 0.0);
    }

    #[test]
    fn release_keeps_slot_but_clears_down() {
        let mut pointer = Pointer::default();
        pointer.update_down(7, [1.0, 1.0], [100.0, 100.0]);
        pointer.update_up();
        assert!(!pointer.down);
        assert_eq!(pointer.id, 7);
    }

    #[test]
    fn wrap_stays_in_range() {
        assert_eq!(wrap(1.25, 0.0, 1.0), 0.25);
        assert_eq!(wrap(0.5, 0.0, 0.0), 0.0);
    }

    #[test]
    fn hsv_primaries() {
        assert_eq!(hsv_to_rgb(0.0, 1.0, 1.0), [1.0, 0.0, 0.0]);
        let g = hsv_to_rgb(1.0 / 3.0, 1.0, 1.0);
        assert!(g[1] > 0.99 && g[0] < 0.01);
    }
}
