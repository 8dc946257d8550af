use meshgen_geom::{Aabb, Mat3, Rect, Vec2, Vec3};

fn approx_eq(a: f32, b: f32, eps: f32) -> bool {
    (a - b).abs() <= eps
}

fn vec3_approx_eq(a: Vec3, b: Vec3, eps: f32) -> bool {
    approx_eq(a.x, b.x, eps) && approx_eq(a.y, b.y, eps) && approx_eq(a.z, b.z, eps)
}

#[test]
fn vec3_add_sub() {
    let a = Vec3::new(1.0, 2.0, 3.0);
    let b = Vec3::new(-4.0, 5.0, -6.0);
    let c = a + b;
    assert!(vec3_approx_eq(c, Vec3::new(-3.0, 7.0, -3.0), 1e-6));

    let d = c - a;
    assert!(vec3_approx_eq(d, b, 1e-6));
}

#[test]
fn vec3_distance_sq_and_zero() {
    let a = Vec3::new(1.0, 0.0, 1.0);
    let b = Vec3::new(4.0, 0.0, 5.0);
    assert!(approx_eq(a.distance_sq(b), 25.0, 1e-6));
    assert!((a - a).is_zero());
    assert!(!a.is_zero());
    assert_eq!(b.xz(), Vec2::new(4.0, 5.0));
}

#[test]
fn rect_area_and_sides() {
    let r = Rect::new(0.0, 10.0, 4.0, 12.0);
    assert!(approx_eq(r.width(), 4.0, 1e-6));
    assert!(approx_eq(r.depth(), 2.0, 1e-6));
    assert!(approx_eq(r.area(), 8.0, 1e-6));
    assert!(approx_eq(r.min_side(), 2.0, 1e-6));
    assert!(!r.is_empty());
    assert!(Rect::new(1.0, 1.0, 1.0, 5.0).is_empty());
}

#[test]
fn rect_distance_is_zero_inside_and_squared_outside() {
    let r = Rect::new(0.0, 0.0, 10.0, 10.0);
    assert_eq!(r.distance_sq_to(Vec2::new(5.0, 5.0)), 0.0);
    assert_eq!(r.distance_sq_to(Vec2::new(10.0, 0.0)), 0.0);
    assert!(approx_eq(r.distance_sq_to(Vec2::new(13.0, 5.0)), 9.0, 1e-6));
    assert!(approx_eq(r.distance_sq_to(Vec2::new(-3.0, -4.0)), 25.0, 1e-6));
}

#[test]
fn rect_overlap_and_contains() {
    let a = Rect::new(0.0, 0.0, 10.0, 10.0);
    let b = Rect::new(5.0, 5.0, 15.0, 15.0);
    let c = Rect::new(11.0, 0.0, 20.0, 10.0);
    assert!(a.overlaps(&b));
    assert!(!a.overlaps(&c));
    assert!(a.contains(Vec2::new(0.0, 10.0)));
    assert!(!a.contains(Vec2::new(-0.1, 5.0)));
}

#[test]
fn aabb_footprint() {
    let b = Aabb::new(Vec3::new(-1.0, -5.0, 2.0), Vec3::new(3.0, 5.0, 8.0));
    assert_eq!(b.xz_rect(), Rect::new(-1.0, 2.0, 3.0, 8.0));
}

#[test]
fn rotation_y_quarter_turn() {
    let m = Mat3::rotation_y(std::f32::consts::FRAC_PI_2);
    let v = m.transform(Vec3::new(1.0, 2.0, 0.0));
    assert!(vec3_approx_eq(v, Vec3::new(0.0, 2.0, 1.0), 1e-6));
    assert_eq!(Mat3::rotation_y(0.0), Mat3::IDENTITY);
}
