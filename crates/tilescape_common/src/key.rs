/// Keys a frontend can report to an [`crate::App`].
///
/// Kept deliberately small: demo scenes only need a handful of toggles
/// plus the arrow keys.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub enum Key {
    Num1,
    Num2,
    Num3,
    Num4,
    Q,
    W,
    E,
    R,
    A,
    S,
    D,
    F,
    Z,
    X,
    C,
    V,
    Up,
    Down,
    Left,
    Right,
    Space,
    None,
}
