use ndarray::{array, Array2};
use nipals_pls::Nipals;

fn main() {
    // Small centred blocks: two informative predictors, one nuisance.
    let x = Array2::from_shape_vec(
        (6, 3),
        vec![
            1.0, 0.5, 0.1, //
            0.8, -0.2, -0.3, //
            -0.4, 0.9, 0.2, //
            -1.2, -0.6, 0.0, //
            0.3, -1.0, -0.1, //
            -0.5, 0.4, 0.1,
        ],
    )
    .unwrap();
    let b = array![[2.0], [-1.0], [0.0]];
    let y = x.dot(&b);

    let mut pls = Nipals::new();
    pls.fit(&x, &y, 2, "sample").expect("NIPALS fit failed");

    println!("NIPALS fit works!");
    println!("Weights shape: {:?}", pls.weights().unwrap().dim());
    println!("Coefficients:\n{:?}", pls.coefficients().unwrap());

    let (projected, responses) = pls.transform(&x).expect("transform failed");
    println!("Projected shape: {:?}, responses shape: {:?}", projected.dim(), responses.dim());
    if let Some(model) = pls.model() {
        println!("Diagnostics: {:?}", model.diagnostics());
    }
}
