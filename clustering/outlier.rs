use super::Point;

/// Marks members of `cluster` that fall outside the Tukey fences
/// `[Q1 - 1.5 IQR, Q3 + 1.5 IQR]` on either axis by overwriting their label with
/// `marker`. `labels` is aligned with `points`. Quartiles are taken as the sorted
/// values at positions `n / 4` and `3n / 4`.
pub fn mark_outliers(
    points: &[Point],
    labels: &mut [i8],
    cluster: i8,
    marker: i8,
    x_sorted: &mut Vec<f32>,
    y_sorted: &mut Vec<f32>,
) {
    x_sorted.clear();
    y_sorted.clear();
    for (point, _) in points
        .iter()
        .zip(labels.iter())
        .filter(|(_, label)| **label == cluster)
    {
        x_sorted.push(point[0]);
        y_sorted.push(point[1]);
    }
    let n = x_sorted.len();
    if n == 0 {
        return;
    }

    let (x_min, x_max) = fences(x_sorted);
    let (y_min, y_max) = fences(y_sorted);

    for (point, label) in points.iter().zip(labels.iter_mut()) {
        if *label != cluster {
            continue;
        }
        let [x, y] = *point;
        if x < x_min || x_max < x || y < y_min || y_max < y {
            *label = marker;
        }
    }
}

fn fences(values: &mut [f32]) -> (f32, f32) {
    values.sort_unstable_by(f32::total_cmp);
    let n = values.len();
    let q1 = values[n / 4];
    let q3 = values[n * 3 / 4];
    let iqr = q3 - q1;
    (q1 - 1.5 * iqr, q3 + 1.5 * iqr)
}
